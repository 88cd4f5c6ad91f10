//! A fake sysfs backlight class directory.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// `<root>/<device>/{brightness,max_brightness}` in a temporary directory,
/// removed on drop.
pub struct FakeBacklight {
    device_dir: PathBuf,
    root: TempDir,
}

impl FakeBacklight {
    /// Create device `name` with the given maximum and current raw level.
    pub fn new(name: &str, max_brightness: u32, brightness: u32) -> Self {
        let root = TempDir::new().expect("failed to create temp dir");
        let device_dir = root.path().join(name);
        std::fs::create_dir(&device_dir).expect("failed to create device dir");
        std::fs::write(device_dir.join("max_brightness"), format!("{max_brightness}\n"))
            .expect("failed to write max_brightness");

        let fake = Self {
            device_dir,
            root,
        };
        fake.set_raw(brightness);
        fake
    }

    /// The class directory to use as `backlight.sysfs_root`.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Current raw level, as the daemon last wrote it.
    pub fn raw(&self) -> u32 {
        std::fs::read_to_string(self.brightness_path())
            .expect("failed to read brightness")
            .trim()
            .parse()
            .expect("brightness is not an integer")
    }

    /// Change the level behind the daemon's back, like a hardware key would.
    pub fn set_raw(&self, brightness: u32) {
        self.write_raw_content(&format!("{brightness}\n"));
    }

    /// Replace the brightness file content verbatim.
    pub fn write_raw_content(&self, content: &str) {
        std::fs::write(self.brightness_path(), content).expect("failed to write brightness");
    }

    fn brightness_path(&self) -> PathBuf {
        self.device_dir.join("brightness")
    }
}
