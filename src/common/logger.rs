use crate::common::config::LoggerConfig;
use log::{info, LevelFilter};
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};
use std::fs;
use std::path::Path;
use std::str::FromStr;

const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {t} - {m}\n";
const CONSOLE_PATTERN: &str = "{d(%H:%M:%S%.3f)} {h({l:<5})} {t} - {m}\n";

fn parse_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::Info)
}

fn stderr_appender(level: LevelFilter) -> Appender {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();
    Appender::builder()
        .filter(Box::new(ThresholdFilter::new(level)))
        .build("stderr", Box::new(stderr))
}

/// Rolling log file plus stderr, as used by the forwarding daemon.
pub fn setup_logger(config: LoggerConfig) -> Result<log4rs::Handle, Box<dyn std::error::Error>> {
    let level = parse_level(&config.level);
    let trigger_file_size = config.file_size * 1024 * 1024;

    let trigger = SizeTrigger::new(trigger_file_size);
    let roller = FixedWindowRoller::builder()
        .base(0)
        .build(&config.archive_pattern, config.file_count)?;
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    if let Some(parent) = Path::new(&config.path).parent() {
        fs::create_dir_all(parent)?;
    }

    let logfile = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
        .build(&config.path, Box::new(policy))?;

    let runtime_config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .appender(stderr_appender(level))
        .build(
            Root::builder()
                .appender("logfile")
                .appender("stderr")
                .build(level),
        )?;

    let handle = log4rs::init_config(runtime_config)?;

    info!(
        "Logger initialized ({}), file: '{}', archive: '{}'",
        level, config.path, config.archive_pattern
    );

    Ok(handle)
}

/// Stderr only, for short-lived tools such as the test server.
pub fn setup_console_logger(level: &str) -> Result<log4rs::Handle, Box<dyn std::error::Error>> {
    let level = parse_level(level);
    let runtime_config = Config::builder()
        .appender(stderr_appender(level))
        .build(Root::builder().appender("stderr").build(level))?;
    Ok(log4rs::init_config(runtime_config)?)
}
