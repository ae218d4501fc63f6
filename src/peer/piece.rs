use std::fmt;

/// Identity of one piece: the tracked file it belongs to and its index.
///
/// Requests always cover a whole piece, so this doubles as the request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceId {
    pub file_id: String,
    pub index: u32,
}

impl PieceId {
    pub fn new(file_id: impl Into<String>, index: u32) -> Self {
        Self {
            file_id: file_id.into(),
            index,
        }
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_id, self.index)
    }
}
