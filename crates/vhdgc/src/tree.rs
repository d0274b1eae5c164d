//! VDI tree rendering for logs and the CLI.

use crate::vdi::{Vdi, VdiMap};

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One-line summary: `*` marks hidden VDIs, `!` unreadable ones.
pub fn describe(vdi: &Vdi) -> String {
    let mut flags = String::new();
    if vdi.hidden {
        flags.push('*');
    }
    if vdi.scan_error {
        flags.push('!');
    }
    let phys = vdi
        .size_vhd
        .map(format_size)
        .unwrap_or_else(|| "?".to_string());
    let mut line = format!("{}{} ({}/{})", flags, vdi.uuid, format_size(vdi.size_virt), phys);
    if let Some(lv) = vdi.lv() {
        line.push_str(&format!(" lv={}", format_size(lv.size_lv)));
        if lv.raw {
            line.push_str(" raw");
        }
        if lv.active {
            line.push_str(" active");
        }
        if lv.readonly {
            line.push_str(" ro");
        }
    }
    line
}

/// Render every tree in `roots` with ASCII connectors.
pub fn tree_lines(vdis: &VdiMap, roots: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    for root in roots {
        push_node(vdis, root, "", None, &mut lines);
    }
    lines
}

fn push_node(vdis: &VdiMap, uuid: &str, prefix: &str, is_last: Option<bool>, out: &mut Vec<String>) {
    let Some(vdi) = vdis.get(uuid) else {
        return;
    };
    let connector = match is_last {
        None => "",
        Some(true) => "`-- ",
        Some(false) => "|-- ",
    };
    out.push(format!("{}{}{}", prefix, connector, describe(vdi)));

    let child_prefix = match is_last {
        None => String::new(),
        Some(true) => format!("{}    ", prefix),
        Some(false) => format!("{}|   ", prefix),
    };
    for (i, child) in vdi.children.iter().enumerate() {
        let last = i + 1 == vdi.children.len();
        push_node(vdis, child, &child_prefix, Some(last), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdi::tests::{file_vdi, link};

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(8 << 20), "8.0 MB");
        assert_eq!(format_size(3 << 30), "3.0 GB");
    }

    #[test]
    fn test_tree_connectors() {
        let mut vdis = VdiMap::new();
        for v in [
            file_vdi("base", "", true),
            file_vdi("a", "base", false),
            file_vdi("b", "base", true),
            file_vdi("c", "b", false),
        ] {
            vdis.insert(v.uuid.clone(), v);
        }
        link(&mut vdis);

        let lines = tree_lines(&vdis, &["base".to_string()]);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("*base "));
        assert!(lines[1].starts_with("|-- a "));
        assert!(lines[2].starts_with("`-- *b "));
        assert!(lines[3].starts_with("    `-- c "));
    }
}
