use std::path::PathBuf;

pub const DEFAULT_HTTP_PORT: u16 = 3000;

const APP_DIR: &str = "promptdj";

pub fn data_dir() -> PathBuf {
    // ~/.local/share/promptdj on unix-likes, including macOS, for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    // PROMPTDJ_CONFIG_DIR wins so a checkout can carry its own config/
    if let Ok(dir) = std::env::var("PROMPTDJ_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn log_path() -> PathBuf {
    data_dir().join("daemon.log")
}
