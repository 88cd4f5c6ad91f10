//! Screen backlight control through the sysfs `backlight` class.
//!
//! A device directory holds a `brightness` file (raw level, writable) and a
//! `max_brightness` file. Clients work in percent; the raw level is derived
//! from the device maximum, clamped to the configured minimum, and stepped
//! by `step_percent` for `up`/`down`.
//!
//! The current percentage is an [`Observable`]: every successful write
//! publishes it, and while someone is subscribed a poller samples the file
//! so external changes (hardware keys, other tools) reach subscribers too.

use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use perch_config::BacklightConfig;
use tracing::{debug, info, warn};

use crate::ipc::{CommandError, CommandRegistry, Connection, Message, Request};
use crate::pubsub::{Observable, PollConfig};
use crate::reload::{ReloadBroadcast, ReloadListener};

/// Command prefix and response kind.
pub const BRIGHTNESS: &str = "brightness";

const PERCENT_ARGUMENT: &str = "brightness percent";

/// Errors from backlight device access.
#[derive(Debug, thiserror::Error)]
pub enum BacklightError {
    #[error("backlight device unavailable")]
    Unavailable,

    #[error("no backlight device found in {0}")]
    NoDevice(PathBuf),

    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("unexpected content in {path}: {content:?}")]
    Parse { path: PathBuf, content: String },

    #[error("brightness file {0} is a directory")]
    NotAFile(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> BacklightError + '_ {
    move |source| BacklightError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Round `raw` to the nearest multiple of `step`.
fn snap_to_step(raw: f64, step: f64) -> f64 {
    (raw / step).round() * step
}

/// Percentage of `raw` relative to `maximum`, rounded.
fn to_percent(raw: u32, maximum: u32) -> u32 {
    (f64::from(raw) * 100.0 / f64::from(maximum)).round() as u32
}

/// A detected device and the raw limits derived from the configuration.
#[derive(Debug, Clone, PartialEq)]
struct Device {
    brightness_path: PathBuf,
    maximum_raw: u32,
    minimum_raw: u32,
    one_percent_raw: f64,
    step_raw: f64,
}

impl Device {
    fn detect(config: &BacklightConfig) -> Result<Self, BacklightError> {
        let root = Path::new(&config.sysfs_root);
        let dir = if config.device_name.is_empty() {
            first_device(root)?
        } else {
            root.join(&config.device_name)
        };

        let brightness_path = dir.join("brightness");
        let metadata = fs::metadata(&brightness_path).map_err(io_error(&brightness_path))?;
        if metadata.is_dir() {
            return Err(BacklightError::NotAFile(brightness_path));
        }

        let maximum_raw = read_u32(&dir.join("max_brightness"))?;
        if maximum_raw == 0 {
            return Err(BacklightError::Parse {
                path: dir.join("max_brightness"),
                content: "0".to_string(),
            });
        }

        let one_percent_raw = f64::from(maximum_raw) / 100.0;
        let minimum_raw =
            ((config.minimum_percent * one_percent_raw).round() as u32).min(maximum_raw);
        Ok(Self {
            brightness_path,
            maximum_raw,
            minimum_raw,
            one_percent_raw,
            step_raw: config.step_percent * one_percent_raw,
        })
    }

    fn read_raw(&self) -> Result<u32, BacklightError> {
        read_u32(&self.brightness_path)
    }

    fn read_percent(&self) -> Result<u32, BacklightError> {
        Ok(to_percent(self.read_raw()?, self.maximum_raw))
    }

    /// Write `raw` clamped to the device limits; returns the resulting percent.
    fn write_raw(&self, raw: f64) -> Result<u32, BacklightError> {
        let raw = raw
            .round()
            .clamp(f64::from(self.minimum_raw), f64::from(self.maximum_raw)) as u32;
        fs::write(&self.brightness_path, raw.to_string()).map_err(io_error(&self.brightness_path))?;
        Ok(to_percent(raw, self.maximum_raw))
    }
}

/// First entry of `root`, in name order.
fn first_device(root: &Path) -> Result<PathBuf, BacklightError> {
    let mut names: Vec<PathBuf> = fs::read_dir(root)
        .map_err(io_error(root))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    names.sort();
    names
        .into_iter()
        .next()
        .ok_or_else(|| BacklightError::NoDevice(root.to_path_buf()))
}

fn read_u32(path: &Path) -> Result<u32, BacklightError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    content.trim().parse().map_err(|_| BacklightError::Parse {
        path: path.to_path_buf(),
        content: content.trim().to_string(),
    })
}

type SharedDevice = Arc<Mutex<Option<Device>>>;

fn lock(device: &SharedDevice) -> MutexGuard<'_, Option<Device>> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backlight state owner.
#[derive(Debug)]
pub struct Backlight {
    device: SharedDevice,
    brightness: Observable<u32>,
    write_order: tokio::sync::Mutex<()>,
}

impl Backlight {
    /// Set up from `config`. A missing device is logged, not fatal: every
    /// command reports the device as unavailable until a reload finds one.
    pub fn new(config: &BacklightConfig) -> Arc<Self> {
        let backlight = Arc::new(Self {
            device: Arc::new(Mutex::new(None)),
            brightness: Observable::new(),
            write_order: tokio::sync::Mutex::new(()),
        });
        if let Err(e) = backlight.reload(config) {
            warn!(error = %e, "backlight unavailable");
        }
        backlight
    }

    /// Re-detect the device under `config` and restart polling with the new
    /// settings. Subscribers are kept.
    pub fn reload(&self, config: &BacklightConfig) -> Result<(), BacklightError> {
        let detected = if config.enabled {
            Device::detect(config)
        } else {
            Err(BacklightError::Unavailable)
        };

        let result = match detected {
            Ok(device) => {
                info!(
                    path = %device.brightness_path.display(),
                    max = device.maximum_raw,
                    "backlight device ready"
                );
                *lock(&self.device) = Some(device);
                Ok(())
            }
            Err(e) => {
                *lock(&self.device) = None;
                Err(e)
            }
        };

        // The poll function locks the device, so reconfigure outside the lock
        let poll = result.is_ok().then(|| {
            let device = Arc::clone(&self.device);
            PollConfig::new(config.poll_interval(), move || {
                let device = lock(&device).clone()?;
                device
                    .read_percent()
                    .map_err(|e| debug!(error = %e, "brightness sample failed"))
                    .ok()
            })
        });
        self.brightness.reconfigure(poll);
        result
    }

    /// Apply every configuration announced on `broadcast`.
    pub fn listen_reload(
        self: &Arc<Self>,
        broadcast: &ReloadBroadcast<BacklightConfig>,
    ) -> ReloadListener {
        let weak = Arc::downgrade(self);
        broadcast.listen(move |config| {
            let weak = weak.clone();
            async move {
                if let Some(backlight) = weak.upgrade()
                    && let Err(e) = backlight.reload(&config)
                {
                    warn!(error = %e, "backlight reload failed");
                }
            }
        })
    }

    /// The observed brightness percentage.
    pub fn observable(&self) -> &Observable<u32> {
        &self.brightness
    }

    fn with_device<R>(
        &self,
        f: impl FnOnce(&Device) -> Result<R, BacklightError>,
    ) -> Result<R, BacklightError> {
        let guard = lock(&self.device);
        let device = guard.as_ref().ok_or(BacklightError::Unavailable)?;
        f(device)
    }

    /// Current brightness in percent.
    pub fn get(&self) -> Result<u32, BacklightError> {
        self.with_device(Device::read_percent)
    }

    /// Set brightness to `percent` (clamped to the device limits) and
    /// publish the result.
    pub async fn set(&self, percent: i64) -> Result<u32, BacklightError> {
        self.write(|device| device.write_raw(percent as f64 * device.one_percent_raw))
            .await
    }

    /// Raise brightness by one step.
    pub async fn up(&self) -> Result<u32, BacklightError> {
        self.write(|device| {
            let raw = f64::from(device.read_raw()?);
            device.write_raw(snap_to_step(raw + device.step_raw, device.step_raw))
        })
        .await
    }

    /// Lower brightness by one step.
    pub async fn down(&self) -> Result<u32, BacklightError> {
        self.write(|device| {
            let raw = f64::from(device.read_raw()?);
            device.write_raw(snap_to_step(raw - device.step_raw, device.step_raw))
        })
        .await
    }

    async fn write(
        &self,
        f: impl FnOnce(&Device) -> Result<u32, BacklightError>,
    ) -> Result<u32, BacklightError> {
        let _order = self.write_order.lock().await;
        let percent = self.with_device(f)?;
        self.brightness.publish(percent).await;
        Ok(percent)
    }

    /// The `brightness …` commands.
    pub fn commands(self: &Arc<Self>) -> CommandRegistry {
        let get = {
            let this = Arc::clone(self);
            move |conn: Arc<Connection>, _request: Request| {
                let this = Arc::clone(&this);
                async move { reply(&conn, this.get()?).await }
            }
        };

        CommandRegistry::new()
            .command(BRIGHTNESS, "Get current brightness", &[], get.clone())
            .command("brightness get", "Get current brightness", &[], get)
            .command("brightness up", "Increase brightness", &[], {
                let this = Arc::clone(self);
                move |conn, _request| {
                    let this = Arc::clone(&this);
                    async move { reply(&conn, this.up().await?).await }
                }
            })
            .command("brightness down", "Decrease brightness", &[], {
                let this = Arc::clone(self);
                move |conn, _request| {
                    let this = Arc::clone(&this);
                    async move { reply(&conn, this.down().await?).await }
                }
            })
            .command("brightness set", "Set brightness", &[PERCENT_ARGUMENT], {
                let this = Arc::clone(self);
                move |conn, request: Request| {
                    let this = Arc::clone(&this);
                    async move {
                        let percent = parse_percent(&request.value)?;
                        reply(&conn, this.set(percent).await?).await
                    }
                }
            })
            .command(
                "brightness subscribe",
                "Get brightness each time it changes",
                &[],
                {
                    let this = Arc::clone(self);
                    move |conn, _request| {
                        this.subscribe(&conn);
                        async { Ok(()) }
                    }
                },
            )
            .command(
                "brightness unsubscribe",
                "Stop getting brightness on change",
                &[],
                {
                    let this = Arc::clone(self);
                    move |conn: Arc<Connection>, _request| {
                        this.brightness.unsubscribe(conn.id());
                        conn.cancel_on_close(BRIGHTNESS);
                        async { Ok(()) }
                    }
                },
            )
    }

    /// Stream every brightness change to `conn` until it unsubscribes or
    /// goes away. Returns immediately.
    fn subscribe(self: &Arc<Self>, conn: &Arc<Connection>) {
        let id = conn.id();
        let sink = Arc::downgrade(conn);
        let subscribed = self.brightness.subscribe(id, true, move |percent| {
            let sink = sink.clone();
            async move {
                let Some(conn) = sink.upgrade() else {
                    return ControlFlow::Break(());
                };
                match conn.send(&brightness_message(percent)).await {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        debug!(connection = %id, error = %e, "subscriber gone");
                        ControlFlow::Break(())
                    }
                }
            }
        });
        if !subscribed {
            return;
        }

        let backlight = Arc::downgrade(self);
        conn.on_close(BRIGHTNESS, move || async move {
            if let Some(backlight) = backlight.upgrade() {
                backlight.brightness.unsubscribe(id);
            }
        });
    }
}

fn brightness_message(percent: u32) -> Message {
    Message::new(BRIGHTNESS, percent.to_string())
}

async fn reply(conn: &Connection, percent: u32) -> Result<(), CommandError> {
    conn.send(&brightness_message(percent)).await?;
    Ok(())
}

fn parse_percent(value: &str) -> Result<i64, CommandError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CommandError::MissingArgument(PERCENT_ARGUMENT));
    }
    value.parse().map_err(|_| CommandError::InvalidArgument {
        name: PERCENT_ARGUMENT,
        reason: format!("{value:?} is not an integer"),
    })
}
