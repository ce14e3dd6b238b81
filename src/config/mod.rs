use crate::error::Error;
use crate::notify::NotifierSpec;
use crate::nvr::DetectionType;
use crate::template::PathTemplate;
use anyhow::Result;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

pub mod units;

use units::{parse_duration, parse_size};

/// Command line / environment arguments.
///
/// Precedence is CLI > environment > default.
#[derive(Parser, Debug)]
#[command(
    name = "protect-vault",
    version,
    about = "Continuously backs up UniFi Protect event clips to an rclone remote"
)]
pub struct Cli {
    /// Address of the UniFi Protect instance
    #[arg(long, env = "UFP_ADDRESS")]
    pub address: String,

    /// Port of the UniFi Protect instance
    #[arg(long, env = "UFP_PORT", default_value_t = 443)]
    pub port: u16,

    /// Username to log into the UniFi Protect instance
    #[arg(long, env = "UFP_USERNAME")]
    pub username: String,

    /// Password for the UniFi Protect user
    #[arg(long, env = "UFP_PASSWORD")]
    pub password: String,

    /// Whether to validate the NVR's TLS certificate
    #[arg(
        long,
        env = "UFP_SSL_VERIFY",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub verify_ssl: bool,

    /// rclone destination in the format {remote}:{path on remote},
    /// e.g. `gdrive:/backups/unifi_protect`
    #[arg(long, env = "RCLONE_DESTINATION")]
    pub rclone_destination: String,

    /// How long event clips are kept on the remote (e.g. `7d`, `2w`)
    #[arg(long, env = "RCLONE_RETENTION", default_value = "7d")]
    pub retention: String,

    /// Extra arguments passed to `rclone rcat`
    #[arg(long, env = "RCLONE_ARGS", default_value = "", allow_hyphen_values = true)]
    pub rclone_args: String,

    /// Extra arguments passed to `rclone delete`
    #[arg(long, env = "RCLONE_PURGE_ARGS", default_value = "", allow_hyphen_values = true)]
    pub rclone_purge_args: String,

    /// Comma separated list of detection types to back up
    /// (motion, person, vehicle, ring)
    #[arg(
        long,
        env = "DETECTION_TYPES",
        default_value = "motion,person,vehicle,ring"
    )]
    pub detection_types: String,

    /// Camera IDs whose events are not backed up; repeatable. As an
    /// environment variable, separate IDs with whitespace.
    #[arg(long = "ignore-camera", env = "IGNORE_CAMERAS")]
    pub ignore_cameras: Vec<String>,

    /// Template for the file structure on the remote
    #[arg(
        long,
        env = "FILE_STRUCTURE_FORMAT",
        default_value = "{camera_name}/{event.start:%Y-%m-%d}/{event.end:%Y-%m-%dT%H-%M-%S} {detection_type}.mp4"
    )]
    pub file_structure_format: String,

    /// Path of the SQLite event ledger
    #[arg(long, env = "SQLITE_PATH", default_value = "./events.sqlite")]
    pub sqlite_path: PathBuf,

    /// Size of the in-memory download buffer (e.g. `512MiB`)
    #[arg(long, env = "DOWNLOAD_BUFFER_SIZE", default_value = "512MiB")]
    pub download_buffer_size: String,

    /// How often to purge expired clips from the remote
    #[arg(long, env = "PURGE_INTERVAL", default_value = "1d")]
    pub purge_interval: String,

    /// Events longer than this are skipped
    #[arg(long, env = "MAX_EVENT_LENGTH", default_value = "2h")]
    pub max_event_length: String,

    /// On first boot, mark all currently retained events as already backed
    /// up instead of downloading them
    #[arg(long, env = "SKIP_MISSING", default_value_t = false)]
    pub skip_missing: bool,

    /// Notification target as `LEVELS=url`, e.g.
    /// `ERROR,WARNING=https://hooks.example.com/x`; repeatable
    #[arg(long = "apprise-notifier", env = "APPRISE_NOTIFIERS")]
    pub apprise_notifiers: Vec<String>,

    /// Increase logging verbosity (up to -vvvvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Connection settings for the NVR.
#[derive(Debug, Clone)]
pub struct NvrConfig {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub nvr: NvrConfig,
    pub rclone_destination: String,
    pub rclone_args: Vec<String>,
    pub rclone_purge_args: Vec<String>,
    pub retention: Duration,
    pub purge_interval: Duration,
    pub max_event_length: Duration,
    pub download_buffer_size: u64,
    pub detection_types: HashSet<DetectionType>,
    pub ignore_cameras: HashSet<String>,
    pub template: PathTemplate,
    pub sqlite_path: PathBuf,
    pub skip_missing: bool,
    pub notifiers: Vec<NotifierSpec>,
    pub verbosity: u8,
    /// Capacity of each event queue.
    pub event_queue_size: usize,
    /// How often the reconciler scans for missed events.
    pub missing_interval: Duration,
}

impl Config {
    /// Validate and convert the raw CLI arguments. Any failure here is a
    /// configuration error and makes the process exit with code 200.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let retention = parse_duration(&cli.retention)?;
        let purge_interval = parse_duration(&cli.purge_interval)?;
        let max_event_length = parse_duration(&cli.max_event_length)?;
        let download_buffer_size = parse_size(&cli.download_buffer_size)?;

        if purge_interval < Duration::from_secs(60) {
            return Err(Error::Config(format!(
                "purge interval `{}` is below the 1m minimum",
                cli.purge_interval
            ))
            .into());
        }
        if download_buffer_size == 0 {
            return Err(Error::Config("download buffer size must not be zero".to_string()).into());
        }
        if !cli.rclone_destination.contains(':') {
            return Err(Error::Config(format!(
                "rclone destination `{}` is not in remote:path format",
                cli.rclone_destination
            ))
            .into());
        }

        let mut detection_types = HashSet::new();
        for part in cli.detection_types.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match DetectionType::parse(part) {
                Some(t) => {
                    detection_types.insert(t);
                }
                None => {
                    return Err(Error::Config(format!(
                        "`{part}` is not an available detection type"
                    ))
                    .into())
                }
            }
        }
        if detection_types.is_empty() {
            return Err(Error::Config("no detection types selected".to_string()).into());
        }

        // Repeatable on the CLI; whitespace separated when set via env.
        let ignore_cameras: HashSet<String> = cli
            .ignore_cameras
            .iter()
            .flat_map(|v| v.split_whitespace())
            .map(|v| v.to_string())
            .collect();

        let template = PathTemplate::parse(&cli.file_structure_format)?;

        let mut notifiers = Vec::new();
        for raw in &cli.apprise_notifiers {
            notifiers.push(NotifierSpec::parse(raw)?);
        }

        Ok(Config {
            nvr: NvrConfig {
                address: cli.address,
                port: cli.port,
                username: cli.username,
                password: cli.password,
                verify_ssl: cli.verify_ssl,
            },
            rclone_destination: cli.rclone_destination.trim_end_matches('/').to_string(),
            rclone_args: split_args(&cli.rclone_args),
            rclone_purge_args: split_args(&cli.rclone_purge_args),
            retention,
            purge_interval,
            max_event_length,
            download_buffer_size,
            detection_types,
            ignore_cameras,
            template,
            sqlite_path: cli.sqlite_path,
            skip_missing: cli.skip_missing,
            notifiers,
            verbosity: cli.verbose.min(5),
            event_queue_size: 256,
            missing_interval: Duration::from_secs(5 * 60),
        })
    }
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "protect-vault",
            "--address",
            "nvr.local",
            "--username",
            "backup",
            "--password",
            "secret",
            "--rclone-destination",
            "remote:unifi",
        ]
    }

    #[test]
    fn defaults_are_applied() {
        let cli = Cli::parse_from(base_args());
        let config = Config::from_cli(cli).unwrap();

        assert_eq!(config.nvr.port, 443);
        assert!(config.nvr.verify_ssl);
        assert_eq!(config.retention, Duration::from_secs(7 * 86400));
        assert_eq!(config.purge_interval, Duration::from_secs(86400));
        assert_eq!(config.max_event_length, Duration::from_secs(2 * 3600));
        assert_eq!(config.download_buffer_size, 512 * 1024 * 1024);
        assert_eq!(config.detection_types.len(), 4);
        assert!(config.ignore_cameras.is_empty());
        assert!(!config.skip_missing);
    }

    #[test]
    fn rejects_unknown_detection_type() {
        let mut args = base_args();
        args.extend(["--detection-types", "motion,unicorn"]);
        let cli = Cli::parse_from(args);
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn rejects_bad_destination() {
        let mut args = base_args();
        let idx = args.iter().position(|a| *a == "remote:unifi").unwrap();
        args[idx] = "not-a-remote-path";
        let cli = Cli::parse_from(args);
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn rejects_sub_minute_purge_interval() {
        let mut args = base_args();
        args.extend(["--purge-interval", "30s"]);
        let cli = Cli::parse_from(args);
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn splits_env_style_camera_list() {
        let mut args = base_args();
        args.extend(["--ignore-camera", "cam1 cam2", "--ignore-camera", "cam3"]);
        let cli = Cli::parse_from(args);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.ignore_cameras.len(), 3);
    }

    #[test]
    fn splits_rclone_args() {
        let mut args = base_args();
        args.extend(["--rclone-args", "--bwlimit 10M --transfers 2"]);
        let cli = Cli::parse_from(args);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(
            config.rclone_args,
            vec!["--bwlimit", "10M", "--transfers", "2"]
        );
    }
}
