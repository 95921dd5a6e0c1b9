use crate::debugger::error::Error;
use crate::debugger::symbols::SourceLocation;
use crate::debugger::CoreAddr;
use indexmap::IndexMap;

/// Saved position in the execution history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bookmark {
    pub number: u32,
    /// Opaque position, understood only by the layer that produced it.
    pub token: Vec<u8>,
    pub pc: CoreAddr,
    pub location: Option<SourceLocation>,
}

/// Numbered bookmarks. Numbers are never reused.
#[derive(Default)]
pub struct BookmarkLedger {
    bookmarks: IndexMap<u32, Bookmark>,
    last_number: u32,
}

impl BookmarkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&mut self, token: Vec<u8>, pc: CoreAddr, location: Option<SourceLocation>) -> u32 {
        self.last_number += 1;
        let number = self.last_number;
        self.bookmarks.insert(
            number,
            Bookmark {
                number,
                token,
                pc,
                location,
            },
        );
        number
    }

    pub fn delete(&mut self, number: u32) -> Result<Bookmark, Error> {
        self.bookmarks
            .shift_remove(&number)
            .ok_or(Error::BookmarkNotFound(number))
    }

    pub fn delete_all(&mut self) {
        self.bookmarks.clear();
    }

    pub fn get(&self, number: u32) -> Option<&Bookmark> {
        self.bookmarks.get(&number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bookmark> {
        self.bookmarks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }
}
