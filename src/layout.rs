//! On-disk byte layouts (spec.md §6), grounded field-for-field on
//! `DH_HEADER`/`DH_AK_HEADER`/`DH_BLOCK`/`DH_RECORD` from the original
//! format header. All multi-byte fields are little-endian. Layouts here are
//! irregularly packed (no uniform field alignment, union fields, flexible
//! trailing arrays), so they're read/written with explicit byte-slice
//! codecs rather than a `repr(C)` cast.

pub const DH_PRIMARY: u16 = 0x209A;
pub const DH_OVERFLOW: u16 = 0x209B;
pub const DH_INDEX: u16 = 0x209C;

pub const DH_VERSION: u8 = 2;
pub const MAX_INDICES: usize = 32;
pub const AK_BASE_SUBFILE: u16 = 2;
pub const PRIMARY_SUBFILE: u16 = 0;
pub const OVERFLOW_SUBFILE: u16 = 1;

pub const DHT_DATA: u8 = 0;
pub const DHT_BIG_REC: u8 = 1;

pub const DH_BIG_REC_FLAG: u8 = 0x01;

/// Fixed header size used for every primary/overflow subfile (version >= 2
/// files size the header to one group, matching `DHHeaderSize`).
pub fn dh_header_size(group_bytes: u32) -> u32 {
    group_bytes
}

/// Primary/overflow subfile header. Mirrors `DH_HEADER`.
#[derive(Debug, Clone)]
pub struct DhHeader {
    pub magic: u16,
    pub group_size: u32,
    pub modulus: u32,
    pub min_modulus: u32,
    pub big_rec_size: u32,
    pub split_load: u16,
    pub merge_load: u16,
    pub load_bytes: u32,
    pub extended_load_bytes: u16,
    pub mod_value: u32,
    pub longest_id: u16,
    pub free_chain: u32,
    pub flags: u16,
    pub ak_map: u32,
    pub file_version: u8,
    pub trigger_modes: u8,
    pub trigger_name: String,
    pub jnl_fno: u32,
    pub akpath: String,
    pub creation_timestamp: i64,
    pub record_count: i64,
}

impl DhHeader {
    /// The 48-bit load byte counter split across `load_bytes` (low 32 bits)
    /// and `extended_load_bytes` (high 16 bits), per `HeaderLoadBytes`.
    ///
    /// Open question resolved: the original never defines what happens if
    /// the true load exceeds 2^48 bytes. We define it here as a saturating
    /// counter -- `add_load_bytes` clamps at `u48::MAX` instead of wrapping,
    /// so a pathologically large file reports a stable (if no longer
    /// precise) load factor rather than silently wrapping back through
    /// zero and tricking the split/merge logic into misbehaving.
    pub fn load_bytes_total(&self) -> u64 {
        (self.load_bytes as u64) | ((self.extended_load_bytes as u64) << 32)
    }

    pub fn set_load_bytes_total(&mut self, value: u64) {
        const MAX48: u64 = (1u64 << 48) - 1;
        let clamped = value.min(MAX48);
        self.load_bytes = (clamped & 0xFFFF_FFFF) as u32;
        self.extended_load_bytes = ((clamped >> 32) & 0xFFFF) as u16;
    }

    pub fn add_load_bytes(&mut self, delta: i64) {
        let cur = self.load_bytes_total() as i64;
        let next = (cur + delta).max(0) as u64;
        self.set_load_bytes_total(next);
    }

    /// `DHLoad`: percentage load of the file relative to group_size * modulus.
    pub fn load_percent(&self) -> u32 {
        if self.modulus == 0 || self.group_size == 0 {
            return 0;
        }
        ((self.load_bytes_total() as f64 * 100.0)
            / (self.group_size as f64 * self.modulus as f64)) as u32
    }

    pub fn encode(&self, group_bytes: u32) -> Vec<u8> {
        let mut buf = vec![0u8; group_bytes as usize];
        buf[0..2].copy_from_slice(&self.magic.to_le_bytes());
        buf[2..6].copy_from_slice(&self.group_size.to_le_bytes());
        buf[6..10].copy_from_slice(&self.modulus.to_le_bytes());
        buf[10..14].copy_from_slice(&self.min_modulus.to_le_bytes());
        buf[14..18].copy_from_slice(&self.big_rec_size.to_le_bytes());
        buf[18..20].copy_from_slice(&self.split_load.to_le_bytes());
        buf[20..22].copy_from_slice(&self.merge_load.to_le_bytes());
        buf[22..26].copy_from_slice(&self.load_bytes.to_le_bytes());
        buf[26..30].copy_from_slice(&self.mod_value.to_le_bytes());
        buf[30..32].copy_from_slice(&self.longest_id.to_le_bytes());
        buf[32..34].copy_from_slice(&self.extended_load_bytes.to_le_bytes());
        buf[34..38].copy_from_slice(&self.free_chain.to_le_bytes());
        buf[38..40].copy_from_slice(&self.flags.to_le_bytes());
        buf[40..44].copy_from_slice(&self.ak_map.to_le_bytes());
        buf[44] = self.file_version;
        buf[45] = self.trigger_modes;
        write_fixed_str(&mut buf[46..110], &self.trigger_name);
        buf[110..114].copy_from_slice(&self.jnl_fno.to_le_bytes());
        write_fixed_str(&mut buf[114..370], &self.akpath);
        buf[370..378].copy_from_slice(&self.creation_timestamp.to_le_bytes());
        buf[378..386].copy_from_slice(&self.record_count.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            magic: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            group_size: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            modulus: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            min_modulus: u32::from_le_bytes(buf[10..14].try_into().unwrap()),
            big_rec_size: u32::from_le_bytes(buf[14..18].try_into().unwrap()),
            split_load: u16::from_le_bytes(buf[18..20].try_into().unwrap()),
            merge_load: u16::from_le_bytes(buf[20..22].try_into().unwrap()),
            load_bytes: u32::from_le_bytes(buf[22..26].try_into().unwrap()),
            mod_value: u32::from_le_bytes(buf[26..30].try_into().unwrap()),
            longest_id: u16::from_le_bytes(buf[30..32].try_into().unwrap()),
            extended_load_bytes: u16::from_le_bytes(buf[32..34].try_into().unwrap()),
            free_chain: u32::from_le_bytes(buf[34..38].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[38..40].try_into().unwrap()),
            ak_map: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            file_version: buf[44],
            trigger_modes: buf[45],
            trigger_name: read_fixed_str(&buf[46..110]),
            jnl_fno: u32::from_le_bytes(buf[110..114].try_into().unwrap()),
            akpath: read_fixed_str(&buf[114..370]),
            creation_timestamp: i64::from_le_bytes(buf[370..378].try_into().unwrap()),
            record_count: i64::from_le_bytes(buf[378..386].try_into().unwrap()),
        }
    }
}

/// AK subfile header. Mirrors `DH_AK_HEADER`.
#[derive(Debug, Clone)]
pub struct AkHeader {
    pub magic: u16,
    pub flags: u16,
    pub fno: i16,
    pub free_chain: u32,
    pub itype_len: u32,
    pub itype: Vec<u8>,
    pub ak_name: String,
    pub data_creation_timestamp: i64,
    pub collation_map_name: String,
    pub collation_map: Option<[u8; 256]>,
}

pub const AK_ENABLED: u16 = 0x0001;
pub const AK_RIGHT: u16 = 0x0002;
pub const AK_NULLS: u16 = 0x0004;
pub const AK_MV: u16 = 0x0008;
pub const AK_LSORT: u16 = 0x0010;
pub const AK_NOCASE: u16 = 0x0040;

pub const DH_AK_NODE_SIZE: usize = 4096;
pub const MAX_CHILD: usize = 200;

pub const AK_FREE_NODE: u8 = 0;
pub const AK_INT_NODE: u8 = 1;
pub const AK_TERM_NODE: u8 = 2;
pub const AK_ITYPE_NODE: u8 = 3;
pub const AK_BIGREC_NODE: u8 = 4;

impl AkHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DH_AK_NODE_SIZE];
        buf[0..2].copy_from_slice(&self.magic.to_le_bytes());
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..6].copy_from_slice(&self.fno.to_le_bytes());
        buf[6..10].copy_from_slice(&self.free_chain.to_le_bytes());
        buf[10..14].copy_from_slice(&self.itype_len.to_le_bytes());
        let n = self.itype.len().min(512);
        buf[18..18 + n].copy_from_slice(&self.itype[..n]);
        write_fixed_str(&mut buf[530..594], &self.ak_name);
        buf[594..602].copy_from_slice(&self.data_creation_timestamp.to_le_bytes());
        write_fixed_str(&mut buf[602..666], &self.collation_map_name);
        if let Some(map) = &self.collation_map {
            buf[666..922].copy_from_slice(map);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let flags = u16::from_le_bytes(buf[2..4].try_into().unwrap());
        let mut map_buf = [0u8; 256];
        map_buf.copy_from_slice(&buf[666..922]);
        let has_map = map_buf.iter().any(|&b| b != 0);
        Self {
            magic: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            flags,
            fno: i16::from_le_bytes(buf[4..6].try_into().unwrap()),
            free_chain: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            itype_len: u32::from_le_bytes(buf[10..14].try_into().unwrap()),
            itype: buf[18..530].to_vec(),
            ak_name: read_fixed_str(&buf[530..594]),
            data_creation_timestamp: i64::from_le_bytes(buf[594..602].try_into().unwrap()),
            collation_map_name: read_fixed_str(&buf[602..666]),
            collation_map: if has_map { Some(map_buf) } else { None },
        }
    }

    pub fn right_justified(&self) -> bool {
        self.flags & AK_RIGHT != 0
    }
    pub fn case_insensitive(&self) -> bool {
        self.flags & AK_NOCASE != 0
    }
    pub fn multi_valued(&self) -> bool {
        self.flags & AK_MV != 0
    }
    pub fn enabled(&self) -> bool {
        self.flags & AK_ENABLED != 0
    }
}

/// Converts a forward link to its on-disk representation. Version < 2
/// files store a byte offset; version >= 2 stores a group number.
/// Preserved as an explicit, testable, version-dispatched pair of
/// functions rather than inferred from context (§8 property 7).
pub fn set_fwd_link(file_version: u8, group_size: u32, header_bytes: u32, group: u32) -> u32 {
    if group != 0 && file_version < 2 {
        (group - 1) * group_size + header_bytes
    } else {
        group
    }
}

pub fn get_fwd_link(file_version: u8, group_size: u32, header_bytes: u32, link: u32) -> u32 {
    if link != 0 && file_version < 2 {
        (link - header_bytes) / group_size + 1
    } else {
        link
    }
}

pub fn set_ak_fwd_link(file_version: u8, ak_header_bytes: u32, node: u32) -> u32 {
    if node != 0 && file_version < 2 {
        (node - 1) * DH_AK_NODE_SIZE as u32 + ak_header_bytes
    } else {
        node
    }
}

pub fn get_ak_fwd_link(file_version: u8, ak_header_bytes: u32, link: u32) -> u32 {
    if link != 0 && file_version < 2 {
        (link - ak_header_bytes) / DH_AK_NODE_SIZE as u32 + 1
    } else {
        link
    }
}

/// Byte offset of a group within its subfile. `GroupOffset`.
pub fn group_offset(group: u32, group_size: u32, header_bytes: u32) -> u64 {
    ((group as u64 - 1) * group_size as u64) + header_bytes as u64
}

fn write_fixed_str(slot: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(slot.len().saturating_sub(1));
    slot[..n].copy_from_slice(&bytes[..n]);
    for b in &mut slot[n..] {
        *b = 0;
    }
}

fn read_fixed_str(slot: &[u8]) -> String {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fwd_link_is_version_neutral() {
        // version 2+: group numbers pass through untouched.
        assert_eq!(set_fwd_link(2, 1024, 1024, 7), 7);
        assert_eq!(get_fwd_link(2, 1024, 1024, 7), 7);
        // version < 2: round-trips through a byte offset.
        let offset = set_fwd_link(1, 1024, 1024, 7);
        assert_eq!(get_fwd_link(1, 1024, 1024, offset), 7);
    }

    #[test]
    fn header_round_trips() {
        let h = DhHeader {
            magic: DH_PRIMARY,
            group_size: 1024,
            modulus: 4,
            min_modulus: 1,
            big_rec_size: 600,
            split_load: 60,
            merge_load: 40,
            load_bytes: 0,
            extended_load_bytes: 0,
            mod_value: 4,
            longest_id: 3,
            free_chain: 0,
            flags: 0,
            ak_map: 0,
            file_version: DH_VERSION,
            trigger_modes: 0,
            trigger_name: String::new(),
            jnl_fno: 0,
            akpath: String::new(),
            creation_timestamp: 12345,
            record_count: 20,
        };
        let bytes = h.encode(1024);
        let back = DhHeader::decode(&bytes);
        assert_eq!(back.modulus, 4);
        assert_eq!(back.record_count, 20);
    }

    #[test]
    fn load_bytes_saturate_instead_of_wrapping() {
        let mut h = DhHeader {
            magic: DH_PRIMARY,
            group_size: 1024,
            modulus: 1,
            min_modulus: 1,
            big_rec_size: 600,
            split_load: 60,
            merge_load: 40,
            load_bytes: 0,
            extended_load_bytes: 0,
            mod_value: 1,
            longest_id: 0,
            free_chain: 0,
            flags: 0,
            ak_map: 0,
            file_version: DH_VERSION,
            trigger_modes: 0,
            trigger_name: String::new(),
            jnl_fno: 0,
            akpath: String::new(),
            creation_timestamp: 0,
            record_count: 0,
        };
        h.set_load_bytes_total(u64::MAX);
        assert_eq!(h.load_bytes_total(), (1u64 << 48) - 1);
    }
}
