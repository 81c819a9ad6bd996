// Copyright 2020 Ant Group. All rights reserved.
// Copyright (C) 2021 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::io::Result;
use std::path::Path;

use flexi_logger::{
    self, style, DeferredNow, FileSpec, Logger, TS_DASHES_BLANK_COLONS_DOT_BLANK,
};
use log::{Level, LevelFilter, Record};

fn get_file_name<'a>(record: &'a Record) -> Option<&'a str> {
    record.file().map(|v| match v.rfind("/src/") {
        None => v,
        Some(pos) => match v[..pos].rfind('/') {
            None => &v[pos..],
            Some(p) => &v[p..],
        },
    })
}

fn opt_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> std::result::Result<(), std::io::Error> {
    let level = record.level();
    if level == Level::Info {
        write!(
            w,
            "[{}] {} {}",
            now.format(TS_DASHES_BLANK_COLONS_DOT_BLANK),
            record.level(),
            &record.args()
        )
    } else {
        write!(
            w,
            "[{}] {} [{}:{}] {}",
            now.format(TS_DASHES_BLANK_COLONS_DOT_BLANK),
            record.level(),
            get_file_name(record).unwrap_or("<unnamed>"),
            record.line().unwrap_or(0),
            &record.args()
        )
    }
}

fn colored_opt_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> std::result::Result<(), std::io::Error> {
    let level = record.level();
    if level == Level::Info {
        write!(
            w,
            "[{}] {} {}",
            style(level).paint(now.format(TS_DASHES_BLANK_COLONS_DOT_BLANK).to_string()),
            style(level).paint(level.to_string()),
            style(level).paint(record.args().to_string())
        )
    } else {
        write!(
            w,
            "[{}] {} [{}:{}] {}",
            style(level).paint(now.format(TS_DASHES_BLANK_COLONS_DOT_BLANK).to_string()),
            style(level).paint(level.to_string()),
            style(level).paint(get_file_name(record).unwrap_or("<unnamed>")),
            style(level).paint(record.line().unwrap_or(0).to_string()),
            style(level).paint(record.args().to_string())
        )
    }
}

/// Set up logging to a file, or to stderr when `path` is `None`.
pub fn setup_logging(path: Option<&Path>, level: LevelFilter) -> Result<()> {
    if let Some(path) = path {
        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        let basename = path
            .file_stem()
            .and_then(|v| v.to_str())
            .ok_or_else(|| einval!("failed to get log file basename"))?;
        let suffix = path
            .extension()
            .and_then(|v| v.to_str())
            .ok_or_else(|| einval!("failed to get log file extension"))?;

        let mut spec = FileSpec::default()
            .basename(basename)
            .suffix(suffix)
            .suppress_timestamp();
        if let Some(dir) = dir {
            spec = spec.directory(dir);
        }

        Logger::try_with_env_or_str("trace")
            .map_err(|e| einval!(e))?
            .log_to_file(spec)
            .append()
            .format(opt_format)
            .start()
            .map_err(|e| eother!(e))?;
    } else {
        Logger::try_with_env_or_str("trace")
            .map_err(|e| einval!(e))?
            .format(colored_opt_format)
            .start()
            .map_err(|e| eother!(e))?;
    }

    // Rely on the `log` facade to bound the level rather than flexi_logger,
    // so raising verbosity later does not require a logger rebuild.
    log::set_max_level(level);

    Ok(())
}
