// Copyright 2025 Memoir (https://github.com/memoir-mem/memoir)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use clap::Parser;
use memoir_core::{settings, Settings};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "memoir-worker", version, about = "Memoir memory service worker", long_about = None)]
struct Args {
    /// Data directory (overrides the resolved default)
    #[arg(long, env = "MEMOIR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP listen port (overrides settings.json)
    #[arg(long)]
    port: Option<u16>,

    /// Serve the MCP tool surface on stdio instead of running the worker
    #[arg(long)]
    mcp: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = match args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            dir
        }
        None => settings::resolve_data_dir()?,
    };

    let mut settings = Settings::load(&data_dir)?;
    if let Some(port) = args.port {
        settings.port = Some(port);
    }

    if args.mcp {
        // MCP mode logs to stderr only; stdout carries the protocol.
        let state = memoir_server::build_worker_state(&data_dir, settings)?;
        memoir_server::mcp::run_mcp(state).await
    } else {
        memoir_server::init_tracing(&data_dir);
        memoir_server::run_worker(&data_dir, settings).await
    }
}
