use std::path::Path;

use super::BtfTable;

#[test]
fn table_lookup() {
    let table = BtfTable::from_entries(&[("task_struct.cred", 2096), ("cred.uid", 4)]);
    assert_eq!(table.offset("task_struct.cred"), Some(2096));
    assert_eq!(table.offset("cred.uid"), Some(4));
    assert_eq!(table.offset("cred.euid"), None);
}

// Walks the real vmlinux BTF when the host exposes it.
#[test]
fn load_from_host() {
    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        return;
    }
    let table = BtfTable::load().unwrap();
    // These never moved out of their structs on any kernel with BTF.
    assert!(table.offset("task_struct.cred").is_some());
    assert!(table.offset("cred.uid").is_some());
}
