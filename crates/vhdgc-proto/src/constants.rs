//! Persisted names and format constants.
//!
//! These values are shared with the storage manager and the
//! control plane, and are read back after crashes. Keep them stable.

// ─── VHD format ─────────────────────────────────────────────────────────────

/// VHD data block size (2 MiB).
pub const VHD_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Size of the VHD footer.
pub const VHD_FOOTER_SIZE: u64 = 512;

/// Upper bound on the size of a VHD resize journal.
pub const MAX_VHD_JOURNAL_SIZE: u64 = 6 * 1024 * 1024;

/// File extension of VHD files in a file SR.
pub const FILE_EXTN_VHD: &str = ".vhd";

// ─── LVM layout ─────────────────────────────────────────────────────────────

/// LV allocation granularity.
pub const LVM_SIZE_INCREMENT: u64 = 4 * 1024 * 1024;

/// Prefix of the volume group backing an LVHD SR.
pub const VG_PREFIX: &str = "VG_XenStorage-";

/// LV name prefix for VHD-formatted volumes.
pub const LV_PREFIX_VHD: &str = "VHD-";

/// LV name prefix for raw volumes.
pub const LV_PREFIX_RAW: &str = "LV-";

/// LV name prefix for temporary VHD resize journals.
pub const LV_PREFIX_JOURNAL: &str = "jvhd_";

/// Refcount namespace prefix; the SR uuid is appended.
pub const NS_PREFIX_LVM: &str = "lvm-";

/// Prefix given to a VDI while the leaf-coalesce rename swap is in progress.
pub const TMP_RENAME_PREFIX: &str = "OLD_";

// ─── VDI config keys ────────────────────────────────────────────────────────

/// Internal: uuid of the VHD parent.
pub const DB_VHD_PARENT: &str = "vhd-parent";

/// Internal: VDI type (`vhd` or `aio`).
pub const DB_VDI_TYPE: &str = "vdi_type";

/// Internal: base64 of the zlib-compressed block allocation bitmap.
pub const DB_VHD_BLOCKS: &str = "vhd-blocks";

/// Other: per-VDI leaf-coalesce policy.
pub const DB_LEAFCLSC: &str = "leaf-coalesce";

/// Policy value: leaf-coalesce disabled.
pub const LEAFCLSC_DISABLED: &str = "false";

/// Policy value: always live leaf-coalesce, without a timeout.
pub const LEAFCLSC_FORCE: &str = "force";

/// Policy value: needs the VM offline.
pub const LEAFCLSC_OFFLINE: &str = "offline";

// ─── SR config keys ─────────────────────────────────────────────────────────

/// SR other-config: `false` disables GC for the SR.
pub const DB_GC: &str = "gc";

/// SR other-config: `false` disables non-leaf coalescing.
pub const DB_COALESCE: &str = "coalesce";

// ─── Lock names ─────────────────────────────────────────────────────────────

/// Run-lock: one GC instance per SR.
pub const LOCK_TYPE_RUNNING: &str = "running";

/// SR lock guarding VDI map and on-disk structure mutation.
pub const LOCK_TYPE_SR: &str = "sr";

/// Name of the abort flag.
pub const FLAG_TYPE_ABORT: &str = "abort";

// ─── Control-plane plugins ──────────────────────────────────────────────────

/// Plugin used to pause and unpause attached VDIs.
pub const PLUGIN_TAPDISK: &str = "tapdisk";

/// Plugin used to refresh LV state on other hosts.
pub const PLUGIN_ON_SLAVE: &str = "on-slave";

/// Action name of the atomic leaf-coalesce operation.
pub const ATOMIC_OP_COALESCE_LEAF: &str = "coalesce_leaf";
