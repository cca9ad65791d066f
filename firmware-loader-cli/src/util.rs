// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

use log::LevelFilter;
use std::fs;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::Path;

/// `--log-level <LEVEL>` if given. Without it the `RUST_LOG` environment applies.
pub(crate) fn parse_log_level() -> Option<LevelFilter> {
    std::env::args()
        .position(|arg| arg == "--log-level")
        .and_then(|i| std::env::args().nth(i + 1))
        .as_deref()
        .map(|level_str| match level_str.to_uppercase().as_str() {
            "OFF" => LevelFilter::Off,
            "TRACE" => LevelFilter::Trace,
            "DEBUG" => LevelFilter::Debug,
            "INFO" => LevelFilter::Info,
            "WARN" => LevelFilter::Warn,
            "ERROR" => LevelFilter::Error,
            _ => {
                eprintln!("Unknown log level: {}. Using INFO", level_str);
                LevelFilter::Info
            }
        })
}

/// `<command> [inputs...] [--flag value...]`. Every flag takes a value.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CommandLine {
    pub command: String,
    pub inputs: Vec<String>,
    options: Vec<(String, String)>,
}

impl CommandLine {
    /// Parse everything after the program name.
    pub fn parse<I>(args: I) -> IoResult<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut command_line = CommandLine::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            if let Some(flag) = arg.strip_prefix("--") {
                let value = args.next().ok_or_else(|| {
                    IoError::new(ErrorKind::InvalidInput, format!("--{} needs a value", flag))
                })?;
                command_line.options.push((flag.to_string(), value));
            } else if command_line.command.is_empty() {
                command_line.command = arg;
            } else {
                command_line.inputs.push(arg);
            }
        }
        Ok(command_line)
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(flag, _)| flag == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn number(&self, name: &str) -> IoResult<Option<u32>> {
        self.option(name).map(parse_number).transpose()
    }

    pub fn required_number(&self, name: &str) -> IoResult<u32> {
        self.number(name)?
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, format!("--{} is required", name)))
    }

    /// Bus address of the node being updated.
    pub fn address(&self) -> IoResult<u8> {
        let address = self.required_number("address")?;
        u8::try_from(address)
            .map_err(|_| IoError::new(ErrorKind::InvalidInput, format!("Address {} is not a node address", address)))
    }

    pub fn input(&self) -> IoResult<&str> {
        self.inputs
            .first()
            .map(String::as_str)
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "No input file provided"))
    }
}

/// Decimal, or hex with a `0x` prefix.
pub(crate) fn parse_number(text: &str) -> IoResult<u32> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|_| IoError::new(ErrorKind::InvalidInput, format!("'{}' is not a number", text)))
}

pub(crate) fn file_name(path: &Path) -> IoResult<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, format!("{} has no file name", path.display())))
}

pub(crate) fn read_binary_file(path: &str) -> IoResult<Vec<u8>> {
    fs::read(path).map_err(|e| IoError::new(e.kind(), format!("Failed to read {}: {}", path, e)))
}

pub(crate) fn write_binary_file(path: &str, data: &[u8]) -> IoResult<()> {
    fs::write(path, data).map_err(|e| IoError::new(e.kind(), format!("Failed to write {}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn command_inputs_and_flags_are_separated() {
        let command_line =
            CommandLine::parse(args("send app.bin --port /dev/ttyUSB0 --address 0x07 --log-level debug")).unwrap();

        assert_eq!(command_line.command, "send");
        assert_eq!(command_line.input().unwrap(), "app.bin");
        assert_eq!(command_line.option("port"), Some("/dev/ttyUSB0"));
        assert_eq!(command_line.address().unwrap(), 7);
        assert_eq!(command_line.number("baud").unwrap(), None);
    }

    #[test]
    fn flag_without_value_is_an_error() {
        let err = CommandLine::parse(args("simulate app.bin --drop-every")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_number("0x0800_0000").unwrap(), 0x0800_0000);
        assert_eq!(parse_number("115200").unwrap(), 115_200);
        assert!(parse_number("0xZZ").is_err());
        assert!(parse_number("-1").is_err());
    }

    #[test]
    fn address_must_fit_a_byte() {
        let command_line = CommandLine::parse(args("send a.bin --address 300")).unwrap();
        assert!(command_line.address().is_err());
        let command_line = CommandLine::parse(args("send a.bin")).unwrap();
        assert!(command_line.address().is_err());
    }
}
