/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Process entry point: CLI parsing, config loading, log pipeline
//! installation, then handing off to [`swiftd::server::Server`].

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use swiftd::cli::{self, Action};
use swiftd::config;
use swiftd::log::LogPipeline;
use swiftd::server::Server;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match cli::parse(args) {
        Action::PrintHelp => {
            cli::print_usage();
            ExitCode::SUCCESS
        }
        Action::PrintVersion => {
            cli::print_version();
            ExitCode::SUCCESS
        }
        Action::Run { conf_file } => run(conf_file),
    }
}

fn run(conf_file: PathBuf) -> ExitCode {
    let cfg = match config::read_conf(&conf_file) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("swiftd: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = std::fs::create_dir_all(&cfg.log_dir) {
        eprintln!("swiftd: cannot create log directory {:?}: {err}", cfg.log_dir);
        return ExitCode::FAILURE;
    }
    if let Err(err) = LogPipeline::install(cfg.log_dir.clone(), cfg.prog_name.clone(), cfg.log_level) {
        eprintln!("swiftd: failed to install logger: {err}");
        return ExitCode::FAILURE;
    }

    // A write() against a peer that has already closed its read side
    // otherwise raises SIGPIPE and kills the process; the write-handler
    // checks the return value instead, matching `original_source/src/
    // Server.c`'s startup `signal(SIGPIPE, SIG_IGN)`.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    log::info!("starting swiftd on {}:{}, root={:?}, threads={}", cfg.ip_addr, cfg.port, cfg.root, cfg.thread_num);

    let server = match Server::bind(&cfg.ip_addr, cfg.port, cfg.root.clone(), cfg.thread_num) {
        Ok(server) => Arc::new(server),
        Err(err) => {
            log::error!("failed to bind {}:{}: {err}", cfg.ip_addr, cfg.port);
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = server.run() {
        log::error!("reactor loop exited: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
