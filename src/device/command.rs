//! Device command vocabulary.

use std::fmt;

/// A command understood by the arm controller. `Display` yields the exact
/// wire text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Home,
    Pick,
    Place { col: i64, row: i64 },
    Take { col: i64, row: i64 },
    Goto { col: i64 },
    LoadingTake { col: i64, row: i64 },
    AutoStock { rfid: String },
    Mode(&'static str),
    AutoRun(bool),
    /// Operator-typed text, sent verbatim.
    Raw(String),
}

impl DeviceCommand {
    pub fn raw(text: impl Into<String>) -> Self {
        Self::Raw(text.into())
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Home => write!(f, "HOME"),
            Self::Pick => write!(f, "PICK"),
            Self::Place { col, row } => write!(f, "PLACE {col} {row}"),
            Self::Take { col, row } => write!(f, "TAKE {col} {row}"),
            Self::Goto { col } => write!(f, "GOTO {col}"),
            Self::LoadingTake { col, row } => write!(f, "LOADING_TAKE {col} {row}"),
            Self::AutoStock { rfid } => write!(f, "AUTO_STOCK:{rfid}"),
            Self::Mode(keyword) => write!(f, "MODE {keyword}"),
            Self::AutoRun(true) => write!(f, "AUTO START"),
            Self::AutoRun(false) => write!(f, "AUTO STOP"),
            Self::Raw(text) => write!(f, "{}", text.trim()),
        }
    }
}
