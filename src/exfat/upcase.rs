//! Up-case table: how names are compared and hashed.
//!
//! Volumes written here carry a 256-entry table covering Latin-1; characters beyond
//! the table map to themselves. Tables written by other formatters may use the
//! compressed form (`0xFFFF`, count) for identity runs.

/// Mapping from UTF-16 code units to their upper-case form.
#[derive(Debug, Clone, PartialEq)]
pub struct UpcaseTable {
    map: Vec<u16>,
}

impl UpcaseTable {
    /// Upper-case mapping of U+0000..=U+00FF. Characters whose upper case is not a
    /// single code unit (`ß`) map to themselves.
    pub fn latin1() -> Self {
        let map = (0u16..256)
            .map(|unit| {
                let c = char::from(unit as u8);
                let mut upper = c.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(u), None) => u16::try_from(u32::from(u)).unwrap_or(unit),
                    _ => unit,
                }
            })
            .collect();
        Self { map }
    }

    /// Decodes a table as stored on the volume.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut units = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]));
        let mut map = Vec::new();
        while let Some(unit) = units.next() {
            if unit == 0xFFFF {
                if let Some(run) = units.next() {
                    let start = map.len();
                    map.extend((start..start + run as usize).map(|i| i as u16));
                    continue;
                }
            }
            map.push(unit);
        }
        Self { map }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.map.iter().flat_map(|u| u.to_le_bytes()).collect()
    }

    pub fn upcase(&self, unit: u16) -> u16 {
        self.map.get(unit as usize).copied().unwrap_or(unit)
    }

    /// Checksum stored in the up-case table directory entry.
    pub fn checksum(bytes: &[u8]) -> u32 {
        bytes
            .iter()
            .fold(0u32, |sum, &b| sum.rotate_right(1).wrapping_add(u32::from(b)))
    }
}
