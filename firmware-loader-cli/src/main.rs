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

mod image_tools;
mod serial_link;
mod simulate;
mod util;

use crate::serial_link::SerialTransport;
use crate::util::CommandLine;
use busupdate_host_core::{Coordinator, CoordinatorConfig, DirectoryStore, SourceKind, pump};
use busupdate_messages::ImageFooter;
use busupdate_messages::footer::{IMAGE_FOOTER_LEN, IMAGE_INFO_OFFSET};
use embassy_time::Instant;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::Path;
use std::time::Duration;

const USAGE: &str = "\
Usage: firmware-loader-cli <command> [options]

  send <image> --address A [--port P] [--baud 115200] [--staging 0x..]
  stamp <image> --version V --write-addr 0x.. [--load-addr 0x..] [--out F]
  pack-blob <file> --out <slot image>
  simulate <image> --address A [--drop-every N] [--staging 0x..]
  ports

  --log-level <OFF|ERROR|WARN|INFO|DEBUG|TRACE> overrides RUST_LOG";

const DEFAULT_BAUD_RATE: u32 = 115_200;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

fn main() -> IoResult<()> {
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(log_level) = util::parse_log_level() {
        logger.filter_level(log_level);
    }
    logger.format_timestamp_millis().init();

    let command_line = CommandLine::parse(std::env::args().skip(1))?;
    match command_line.command.as_str() {
        "send" => send_image(&command_line),
        "stamp" => image_tools::stamp(&command_line),
        "pack-blob" => image_tools::pack(&command_line),
        "simulate" => simulate::run(&command_line),
        "ports" => list_ports().map(|_| ()),
        "" => {
            eprintln!("{USAGE}");
            Ok(())
        }
        other => {
            eprintln!("{USAGE}");
            Err(IoError::new(ErrorKind::InvalidInput, format!("Unknown command '{}'", other)))
        }
    }
}

fn list_ports() -> IoResult<Vec<String>> {
    let ports = serialport::available_ports().map_err(|e| IoError::new(ErrorKind::Other, e.to_string()))?;

    if ports.is_empty() {
        log::error!("No serial ports found!");
    }
    log::info!("Available serial ports:");
    for port in &ports {
        log::info!("  - {}", port.port_name);
    }
    Ok(ports.into_iter().map(|port| port.port_name).collect())
}

/// Where a firmware image asks to be written, from its embedded footer.
fn firmware_write_address(path: &str) -> IoResult<u32> {
    let image = util::read_binary_file(path)?;
    let start = IMAGE_INFO_OFFSET as usize;
    image
        .get(start..start + IMAGE_FOOTER_LEN)
        .and_then(|bytes| ImageFooter::from_bytes(bytes).ok())
        .filter(|footer| !footer.is_blank())
        .map(|footer| footer.write_addr)
        .ok_or_else(|| IoError::new(ErrorKind::InvalidData, format!("{} has no image footer, stamp it first", path)))
}

fn progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    match ProgressStyle::with_template("[{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} {msg}") {
        Ok(style) => bar.set_style(style.progress_chars("=> ")),
        Err(e) => log::debug!("Default progress style: {}", e),
    }
    bar
}

fn send_image(command_line: &CommandLine) -> IoResult<()> {
    let path = command_line.input()?;
    let address = command_line.address()?;
    let baud_rate = command_line.number("baud")?.unwrap_or(DEFAULT_BAUD_RATE);

    let file = Path::new(path);
    let name = util::file_name(file)?;
    let directory = file.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));

    let staging = match command_line.number("staging")? {
        Some(staging) => staging,
        None if SourceKind::from_name(name) == SourceKind::Firmware => firmware_write_address(path)?,
        None => {
            return Err(IoError::new(ErrorKind::InvalidInput, "--staging is required for data files"));
        }
    };

    let port_name = match command_line.option("port") {
        Some(port) => port.to_string(),
        None => list_ports()?
            .into_iter()
            .next()
            .ok_or_else(|| IoError::new(ErrorKind::NotFound, "No serial port to use"))?,
    };
    let mut transport = SerialTransport::open(&port_name, baud_rate)?;

    let mut coordinator: Coordinator<DirectoryStore, 1> =
        Coordinator::new(DirectoryStore::new(directory), CoordinatorConfig::default());
    coordinator
        .start_session(address, name, staging)
        .map_err(|e| IoError::new(ErrorKind::InvalidInput, format!("Unable to start update: {:?}", e)))?;
    log::info!("Sending {} to node {} at 0x{:08x}", name, address, staging);

    let mut bar: Option<ProgressBar> = None;
    let started = std::time::Instant::now();
    let outcome = loop {
        let now = Instant::from_millis(started.elapsed().as_millis() as u64);
        pump(&mut coordinator, &mut transport, now)?;

        let Some(info) = coordinator
            .session_for(address)
            .and_then(|index| coordinator.get_session_info(index))
        else {
            break Err("Session vanished before finishing");
        };
        bar.get_or_insert_with(|| progress_bar(info.image_size as u64))
            .set_position(info.bytes_sent as u64);

        if let Some(outcome) = info.outcome {
            break outcome.map_err(|reason| reason.as_text());
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    match outcome {
        Ok(()) => {
            if let Some(bar) = bar {
                bar.finish_with_message("done");
            }
            log::info!("Node {} accepted {} in {:.1} s", address, name, started.elapsed().as_secs_f32());
            Ok(())
        }
        Err(reason) => {
            if let Some(bar) = bar {
                bar.abandon_with_message(reason);
            }
            Err(IoError::new(ErrorKind::Other, reason))
        }
    }
}
