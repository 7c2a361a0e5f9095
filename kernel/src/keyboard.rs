//! Keyboard pressed-key map.
//!
//! The keyboard event source reports one byte per scancode with bit 7 as the
//! release flag; the kernel keeps a 128-entry map with 1 for held keys. The
//! GetKeyboardState syscall copies the map out and clears it.

/// Distinct scan indices the map tracks.
pub const KEY_STATES: usize = 128;

pub struct KeyMap {
    pressed: [u8; KEY_STATES],
}

impl KeyMap {
    pub fn new() -> Self {
        KeyMap {
            pressed: [0; KEY_STATES],
        }
    }

    /// Records a press or release for a scan index.
    pub fn set(&mut self, scan: u8, pressed: bool) {
        self.pressed[(scan & 0x7F) as usize] = pressed as u8;
    }

    pub fn is_pressed(&self, scan: u8) -> bool {
        self.pressed[(scan & 0x7F) as usize] != 0
    }

    /// The map as handed to user space.
    pub fn snapshot(&self) -> [u8; KEY_STATES] {
        self.pressed
    }

    pub fn clear(&mut self) {
        self.pressed = [0; KEY_STATES];
    }
}
