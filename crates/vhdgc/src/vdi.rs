//! VDI records and tree predicates.
//!
//! The SR owns every [`Vdi`] in a map keyed by uuid. Parent and children
//! are uuids resolved through that map, so relinking or renaming a VDI
//! only touches map keys and uuid fields.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bitvec::prelude::*;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use vhdgc_proto::constants::VHD_BLOCK_SIZE;
use vhdgc_proto::{GcError, GcResult};

/// Volume state of a VDI in an LVHD SR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvState {
    pub lv_name: String,
    pub size_lv: u64,
    pub active: bool,
    pub readonly: bool,
    /// Plain volume without VHD metadata.
    pub raw: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    File,
    Lvm(LvState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vdi {
    pub uuid: String,
    /// Parent uuid as recorded in the VHD; empty for a base VDI.
    pub parent_uuid: String,
    /// Parent resolved by the last tree build.
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub size_virt: u64,
    /// Physical VHD size, `None` until known.
    pub size_vhd: Option<u64>,
    pub hidden: bool,
    pub scan_error: bool,
    pub path: PathBuf,
    pub backing: Backing,
}

pub type VdiMap = BTreeMap<String, Vdi>;

impl Vdi {
    pub fn lv(&self) -> Option<&LvState> {
        match &self.backing {
            Backing::Lvm(lv) => Some(lv),
            Backing::File => None,
        }
    }

    pub fn lv_mut(&mut self) -> Option<&mut LvState> {
        match &mut self.backing {
            Backing::Lvm(lv) => Some(lv),
            Backing::File => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.lv().is_some_and(|lv| lv.raw)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Refresh on-storage attributes from a newer scan of the same VDI,
    /// keeping tree links and activation state.
    pub fn load(&mut self, fresh: Vdi) {
        self.parent_uuid = fresh.parent_uuid;
        self.size_virt = fresh.size_virt;
        self.size_vhd = fresh.size_vhd;
        self.hidden = fresh.hidden;
        self.scan_error = fresh.scan_error;
        self.path = fresh.path;
        match (&mut self.backing, fresh.backing) {
            (Backing::Lvm(cur), Backing::Lvm(new)) => {
                cur.lv_name = new.lv_name;
                cur.size_lv = new.size_lv;
                cur.readonly = new.readonly;
                cur.raw = new.raw;
                cur.active = cur.active || new.active;
            }
            (cur, new) => *cur = new,
        }
    }
}

fn parent_has_single_child(vdis: &VdiMap, vdi: &Vdi) -> bool {
    vdi.parent
        .as_ref()
        .and_then(|p| vdis.get(p))
        .is_some_and(|p| p.children.len() == 1)
}

/// An interior link that can be folded into its parent: the parent's
/// only child, hidden, with children of its own.
pub fn is_coalesceable(vdis: &VdiMap, uuid: &str) -> bool {
    vdis.get(uuid).is_some_and(|v| {
        !v.scan_error && v.hidden && !v.children.is_empty() && parent_has_single_child(vdis, v)
    })
}

/// A visible leaf that is its parent's only child.
pub fn is_leaf_coalesceable(vdis: &VdiMap, uuid: &str) -> bool {
    vdis.get(uuid).is_some_and(|v| {
        !v.scan_error && !v.hidden && v.children.is_empty() && parent_has_single_child(vdis, v)
    })
}

/// Root of the tree containing `uuid`.
pub fn tree_root<'a>(vdis: &'a VdiMap, uuid: &'a str) -> &'a str {
    let mut cur = uuid;
    while let Some(parent) = vdis.get(cur).and_then(|v| v.parent.as_deref()) {
        cur = parent;
    }
    cur
}

/// Number of levels in the subtree rooted at `uuid`.
pub fn tree_height(vdis: &VdiMap, uuid: &str) -> usize {
    match vdis.get(uuid) {
        Some(v) => 1 + v.children.iter().map(|c| tree_height(vdis, c)).max().unwrap_or(0),
        None => 0,
    }
}

/// All leaves at or below `uuid`.
pub fn all_leaves(vdis: &VdiMap, uuid: &str) -> Vec<String> {
    let Some(v) = vdis.get(uuid) else {
        return Vec::new();
    };
    if v.children.is_empty() {
        return vec![uuid.to_string()];
    }
    v.children.iter().flat_map(|c| all_leaves(vdis, c)).collect()
}

/// Every VDI from `uuid` up to its root.
pub fn ancestry(vdis: &VdiMap, uuid: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut cur = Some(uuid.to_string());
    while let Some(u) = cur {
        cur = vdis.get(&u).and_then(|v| v.parent.clone());
        chain.push(u);
    }
    chain
}

// ---------------------------------------------------------------------------
// Block allocation bitmaps
// ---------------------------------------------------------------------------

/// Compress a block bitmap for storage in the `vhd-blocks` config key.
pub fn encode_blocks(bitmap: &[u8]) -> GcResult<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bitmap)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

pub fn decode_blocks(encoded: &str) -> GcResult<Vec<u8>> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .map_err(|e| GcError::failed(format!("bad vhd-blocks encoding: {}", e)))?;
    let mut bitmap = Vec::new();
    ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut bitmap)?;
    Ok(bitmap)
}

/// Number of blocks allocated in either bitmap.
pub fn count_bits(a: &[u8], b: &[u8]) -> u64 {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut merged: BitVec<u8, Msb0> = BitVec::from_slice(long);
    for i in short.view_bits::<Msb0>().iter_ones() {
        merged.set(i, true);
    }
    merged.count_ones() as u64
}

/// Bytes of data after merging two bitmaps.
pub fn merged_data_size(a: &[u8], b: &[u8]) -> u64 {
    count_bits(a, b) * VHD_BLOCK_SIZE
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn file_vdi(uuid: &str, parent: &str, hidden: bool) -> Vdi {
        Vdi {
            uuid: uuid.to_string(),
            parent_uuid: parent.to_string(),
            parent: None,
            children: Vec::new(),
            size_virt: 8 << 20,
            size_vhd: Some(4096),
            hidden,
            scan_error: false,
            path: PathBuf::from(format!("/sr/{}.vhd", uuid)),
            backing: Backing::File,
        }
    }

    /// Link every VDI to its parent, like a tree build without orphans.
    pub(crate) fn link(vdis: &mut VdiMap) {
        let pairs: Vec<(String, String)> = vdis
            .values()
            .filter(|v| !v.parent_uuid.is_empty())
            .map(|v| (v.uuid.clone(), v.parent_uuid.clone()))
            .collect();
        for (child, parent) in pairs {
            if let Some(p) = vdis.get_mut(&parent) {
                p.children.push(child.clone());
            }
            if let Some(c) = vdis.get_mut(&child) {
                c.parent = Some(parent);
            }
        }
    }

    fn chain() -> VdiMap {
        let mut vdis = VdiMap::new();
        for v in [
            file_vdi("root", "", true),
            file_vdi("mid", "root", true),
            file_vdi("leaf", "mid", false),
        ] {
            vdis.insert(v.uuid.clone(), v);
        }
        link(&mut vdis);
        vdis
    }

    #[test]
    fn test_predicates_on_chain() {
        let vdis = chain();
        assert!(is_coalesceable(&vdis, "mid"));
        assert!(!is_coalesceable(&vdis, "root"));
        assert!(!is_coalesceable(&vdis, "leaf"));
        assert!(is_leaf_coalesceable(&vdis, "leaf"));
        assert!(!is_leaf_coalesceable(&vdis, "mid"));
        for uuid in vdis.keys() {
            assert!(!(is_coalesceable(&vdis, uuid) && is_leaf_coalesceable(&vdis, uuid)));
        }
    }

    #[test]
    fn test_sibling_blocks_coalesce() {
        let mut vdis = chain();
        vdis.insert("leaf2".into(), file_vdi("leaf2", "mid", false));
        vdis.get_mut("mid").unwrap().children.push("leaf2".into());
        vdis.get_mut("leaf2").unwrap().parent = Some("mid".into());
        assert!(!is_leaf_coalesceable(&vdis, "leaf"));
        // mid still is its parent's only child
        assert!(is_coalesceable(&vdis, "mid"));

        vdis.get_mut("mid").unwrap().scan_error = true;
        assert!(!is_coalesceable(&vdis, "mid"));
    }

    #[test]
    fn test_tree_helpers() {
        let vdis = chain();
        assert_eq!(tree_root(&vdis, "leaf"), "root");
        assert_eq!(tree_height(&vdis, "root"), 3);
        assert_eq!(tree_height(&vdis, "leaf"), 1);
        assert_eq!(all_leaves(&vdis, "root"), vec!["leaf".to_string()]);
        assert_eq!(ancestry(&vdis, "leaf"), vec!["leaf", "mid", "root"]);
    }

    #[test]
    fn test_blocks_codec_and_count() {
        let a = [0b1000_0000u8, 0b0000_0001];
        let b = [0b1100_0000u8];
        let encoded = encode_blocks(&a).unwrap();
        assert_eq!(decode_blocks(&encoded).unwrap(), a.to_vec());
        assert_eq!(count_bits(&a, &b), 3);
        assert_eq!(count_bits(&b, &a), 3);
        assert_eq!(merged_data_size(&[], &[]), 0);
        assert!(decode_blocks("not base64!").is_err());
    }
}
