//! Kernel error taxonomy.
//!
//! Every syscall returns a single signed integer; negative values carry one of
//! these errors, numbered like the classic errno table so the user-space
//! `perror` strings line up.

use thiserror::Error;

/// Errors a syscall can surface to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SysError {
    #[error("No such process")]
    Srch,
    #[error("Bad file number")]
    BadF,
    #[error("No child processes")]
    Child,
    #[error("Try again")]
    Again,
    #[error("Out of memory")]
    NoMem,
    #[error("Permission denied")]
    Acces,
    #[error("Bad address")]
    Fault,
    #[error("Invalid argument")]
    Inval,
    #[error("Function not implemented")]
    NoSys,
}

impl SysError {
    /// The errno value behind this error.
    pub const fn errno(self) -> isize {
        match self {
            SysError::Srch => 3,
            SysError::BadF => 9,
            SysError::Child => 10,
            SysError::Again => 11,
            SysError::NoMem => 12,
            SysError::Acces => 13,
            SysError::Fault => 14,
            SysError::Inval => 22,
            SysError::NoSys => 38,
        }
    }

    /// The negated value actually placed in the return register.
    pub const fn to_ret(self) -> isize {
        -self.errno()
    }
}

/// Collapses a syscall result into the signed return-register convention.
pub fn ret(result: Result<isize, SysError>) -> isize {
    match result {
        Ok(v) => v,
        Err(e) => e.to_ret(),
    }
}
