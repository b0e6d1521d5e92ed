//! Interactive widgets emitted by actions.
//!
//! A widget produces a reply carrying an inline keyboard grid; its callbacks
//! come back through the interpreter. The only widget is the calendar.

pub mod calendar;

pub use calendar::{CalAction, CalCallback, CalMode, CalendarSpec};

use serde::{Deserialize, Serialize};

/// One inline-keyboard button.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardButton {
    pub text: String,
    pub callback_data: String,
}

/// Inline keyboard grid attached to a reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub rows: Vec<Vec<KeyboardButton>>,
}

impl Keyboard {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Flat iterator over all buttons, row by row.
    pub fn buttons(&self) -> impl Iterator<Item = &KeyboardButton> {
        self.rows.iter().flatten()
    }
}
