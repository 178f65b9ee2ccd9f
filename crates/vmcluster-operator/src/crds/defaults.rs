//! Default functions for serde defaults in CRD specs.

pub fn storage_size() -> String {
    crate::constants::defaults::STORAGE_SIZE.to_string()
}

pub fn access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

pub fn storage_data_path() -> String {
    crate::constants::defaults::STORAGE_DATA_PATH.to_string()
}

pub fn vminsert_port() -> i32 {
    crate::constants::ports::STORAGE_VMINSERT
}

pub fn vmselect_port() -> i32 {
    crate::constants::ports::STORAGE_VMSELECT
}
