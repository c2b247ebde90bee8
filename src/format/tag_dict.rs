use std::collections::HashMap;

use entitydb_core::{LegacyTagMode, Tag, TagId};

use crate::intern::{intern, Sym};

use super::{Cursor, FormatError};

/// Bijection between tag bodies and 32-bit tag ids.
///
/// Append-only within one file: ids are positional and never reassigned, so
/// records written earlier keep decoding against a dictionary that has grown
/// since. A checkpoint may emit a fresh dictionary.
#[derive(Debug, Default, Clone)]
pub struct TagDict {
    by_id: Vec<Sym>,
    by_body: HashMap<Sym, TagId>,
}

impl TagDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get_or_insert(&mut self, body: &str) -> TagId {
        let sym = intern(body);

        if let Some(id) = self.by_body.get(&sym) {
            return *id;
        }

        let id = self.by_id.len() as TagId;
        self.by_id.push(sym.clone());
        self.by_body.insert(sym, id);
        id
    }

    pub fn id_of(&self, body: &str) -> Option<TagId> {
        self.by_body.get(body).copied()
    }

    pub fn lookup(&self, id: TagId) -> Result<&Sym, FormatError> {
        self.by_id
            .get(id as usize)
            .ok_or(FormatError::UnknownTagId(id))
    }

    pub fn bodies(&self) -> impl Iterator<Item = &Sym> {
        self.by_id.iter()
    }

    /// `count(u32) | { len(u16) | utf8 }*`; ids are positional.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.by_id.len() as u32).to_le_bytes());

        for body in &self.by_id {
            out.extend_from_slice(&(body.len() as u16).to_le_bytes());
            out.extend_from_slice(body.as_bytes());
        }
    }

    /// Decodes a stored dictionary.
    ///
    /// Entries containing a `|` are the legacy whole-wire form; normalize
    /// mode keeps just the body, strict mode refuses the file.
    pub fn decode(buf: &[u8], mode: LegacyTagMode) -> Result<Self, FormatError> {
        let mut cursor = Cursor::new(buf);
        let count = cursor.take_u32()? as usize;

        let mut dict = Self::new();

        for _ in 0..count {
            let len = cursor.take_u16()? as usize;
            let raw = cursor.take_str(len)?;

            let body = if raw.contains('|') {
                match mode {
                    LegacyTagMode::Strict => {
                        return Err(FormatError::LegacyTag(raw.to_string()));
                    }
                    LegacyTagMode::Normalize => {
                        let tag = Tag::parse_wire(raw, mode)
                            .map_err(|e| FormatError::Corrupt(e.to_string()))?;
                        tag.body
                    }
                }
            } else {
                raw.to_string()
            };

            dict.get_or_insert(&body);
        }

        Ok(dict)
    }
}
