//! log4rs setup; everything goes to stderr (and optionally a file), never stdout
use anyhow::Result;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

use crate::config::Config;

const PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {l} {t} - {m}{n}";

pub fn build(level: LevelFilter, log_file: Option<&Path>) -> Result<LogConfig> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder =
        LogConfig::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(path)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    Ok(builder.build(root.build(level))?)
}

/// install the logger at `level`; fails if a logger is already installed
pub fn init(level: LevelFilter) -> Result<()> {
    log4rs::init_config(build(level, None)?)?;
    Ok(())
}

pub fn init_with_config(config: &Config) -> Result<()> {
    let level = config.level_filter()?;
    log4rs::init_config(build(level, config.log_file.as_deref())?)?;
    Ok(())
}

/// install the logger from a log4rs yaml file
pub fn init_from_file(path: &Path) -> Result<()> {
    log4rs::init_file(path, Default::default())?;
    Ok(())
}
