use std::path::PathBuf;

#[cfg(target_os = "macos")]
const PLATFORM: &str = "macos";

#[cfg(target_os = "windows")]
const PLATFORM: &str = "windows";

#[cfg(target_os = "linux")]
const PLATFORM: &str = "linux";

#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
const PLATFORM: &str = "unknown";

/// 数据目录覆盖环境变量
pub const DATA_DIR_ENV: &str = "FACTDECK_DATA_DIR";

pub fn get_app_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    match PLATFORM {
        "macos" => home.join("Library/Application Support/factdeck"),
        "windows" => home.join("AppData/Local/factdeck"),
        _ => home.join(".local/share/factdeck"),
    }
}

pub fn get_database_path() -> PathBuf {
    let mut path = get_app_data_dir();
    path.push("factdeck.db");
    path
}

pub fn get_models_dir() -> PathBuf {
    let mut path = get_app_data_dir();
    path.push("models");
    path
}

pub fn get_sidecars_dir() -> PathBuf {
    let mut path = get_app_data_dir();
    path.push("sidecars");
    path
}
