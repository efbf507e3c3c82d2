//! hw3d-sim - Drive hw3d scenarios on the host
//!
//! Commands:
//! - `hw3d-sim info` - Probe the device and show regions and configuration
//! - `hw3d-sim handoff` - Hand the GPU from process A to process B
//! - `hw3d-sim irq` - Show interrupt coalescing
//!
//! Every command probes a fresh device on the mock platform, using the board
//! description given with `--board` or the built-in MSM7x01A layout.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use hw3d::mock::{msm_resources, MockPlatform};
use hw3d::{
    Hw3d, Hw3dCommand, Hw3dConfig, Hw3dError, IoctlReply, Pid, PlatformResources, RegionId, Role,
};
use serde::Deserialize;

const PID_MASTER: Pid = Pid(1);
const PID_A: Pid = Pid(100);
const PID_B: Pid = Pid(200);

#[derive(Parser)]
#[command(name = "hw3d-sim")]
#[command(version)]
#[command(about = "hw3d - 3D core arbitration simulator", long_about = None)]
struct Cli {
    /// Board description (TOML)
    #[arg(short, long, global = true)]
    board: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the device and show regions and configuration
    Info,

    /// Hand the GPU from process A to process B
    Handoff {
        /// Process A ignores the revoke and gets killed
        #[arg(short, long)]
        unresponsive: bool,

        /// Override the board's revoke deadline
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Fire a burst of interrupts at one waiter
    Irq {
        /// Interrupts in the burst
        #[arg(short, long, default_value_t = 5)]
        count: u32,
    },
}

#[derive(Debug, Deserialize)]
struct BoardFile {
    board: BoardInfo,
    #[serde(default)]
    resources: PlatformResources,
    #[serde(default)]
    driver: Hw3dConfig,
}

#[derive(Debug, Deserialize)]
struct BoardInfo {
    name: String,
    #[serde(default)]
    description: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let board = match &cli.board {
        Some(path) => load_board(path)?,
        None => builtin_board(),
    };

    match cli.command {
        Commands::Info => {
            show_info(&board)?;
        }

        Commands::Handoff {
            unresponsive,
            timeout_ms,
        } => {
            let mut config = board.driver.clone();
            if let Some(ms) = timeout_ms {
                config = config.with_revoke_timeout(Duration::from_millis(ms));
            }
            run_handoff(&board, config, unresponsive)?;
        }

        Commands::Irq { count } => {
            run_irq(&board, count)?;
        }
    }

    Ok(())
}

fn load_board(path: &Path) -> anyhow::Result<BoardFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read board file {}", path.display()))?;
    let board: BoardFile =
        toml::from_str(&text).with_context(|| format!("invalid board file {}", path.display()))?;
    log::info!("loaded board '{}' from {}", board.board.name, path.display());
    Ok(board)
}

fn builtin_board() -> BoardFile {
    BoardFile {
        board: BoardInfo {
            name: "msm7x01a".into(),
            description: "built-in MSM7x01A layout".into(),
        },
        resources: msm_resources(),
        driver: Hw3dConfig::default(),
    }
}

fn probe(
    board: &BoardFile,
    config: Hw3dConfig,
) -> anyhow::Result<(Arc<MockPlatform>, Arc<Hw3d<MockPlatform>>)> {
    let platform = Arc::new(MockPlatform::new());
    let hw3d = Hw3d::probe(Arc::clone(&platform), &board.resources, config)
        .with_context(|| format!("probe failed on board '{}'", board.board.name))?;
    Ok((platform, hw3d))
}

fn show_info(board: &BoardFile) -> anyhow::Result<()> {
    let (platform, hw3d) = probe(board, board.driver.clone())?;
    let master = hw3d.open(Role::Master, PID_MASTER)?;

    println!("{}", format!("hw3d on {}", board.board.name).bold().green());
    if !board.board.description.is_empty() {
        println!("{}", board.board.description.italic());
    }

    println!("\nRegions:");
    if let IoctlReply::Regions(regions) =
        hw3d.ioctl(&master, PID_MASTER, Hw3dCommand::GetRegions)?
    {
        for (id, info) in RegionId::ALL.iter().zip(regions) {
            println!(
                "  {:<5} phys {:#010x}  len {:#08x}  mmap offset {:#010x}",
                id.to_string().bold(),
                info.phys,
                info.len,
                info.map_offset
            );
        }
    }

    let config = hw3d.config();
    println!("\nDriver:");
    println!("  revoke timeout  {:?}", config.revoke_timeout());
    println!("  clocks          {}, {}", config.grp_clock, config.imem_clock);
    println!("  interrupt       {} ({})", board.resources.irq.unwrap_or(0), config.irq_name);
    println!("  nodes           {}", platform.registered_nodes().join(", "));

    hw3d.release(&master);
    Ok(())
}

fn run_handoff(board: &BoardFile, config: Hw3dConfig, unresponsive: bool) -> anyhow::Result<()> {
    let (platform, hw3d) = probe(board, config)?;
    let smi_len = hw3d.regions().get(RegionId::Smi).size;
    let regs_len = hw3d.regions().get(RegionId::Regs).size;

    println!("{} Process A opens the client node", "▶".green());
    let a = hw3d.open(Role::Client, PID_A).context("process A open")?;
    hw3d.mmap(&a, PID_A, RegionId::Regs.map_offset(), regs_len)?;
    let a_smi = hw3d.mmap(&a, PID_A, RegionId::Smi.map_offset(), smi_len)?;
    platform.write_mapping(a_smi.handle, 0, b"process A data");

    let a_thread = if unresponsive {
        println!("  A will ignore the revoke request");
        None
    } else {
        let hw3d = Arc::clone(&hw3d);
        let a = Arc::clone(&a);
        Some(thread::spawn(move || -> Result<(), Hw3dError> {
            hw3d.wait_for_revoke(&a, PID_A)?;
            println!("  A saw the revoke, closing");
            hw3d.flush(&a);
            hw3d.release(&a);
            Ok(())
        }))
    };

    println!("{} Process B opens the client node", "▶".green());
    let started = Instant::now();
    let b = hw3d.open(Role::Client, PID_B).context("process B open")?;
    let waited = started.elapsed();

    if let Some(handle) = a_thread {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("process A thread panicked"))??;
    }

    if platform.terminated().contains(&PID_A) {
        println!(
            "{} A was killed after {:?}; B owns the GPU",
            "✗".red(),
            waited
        );
    } else {
        println!(
            "{} A released cooperatively after {:?}; B owns the GPU",
            "✓".green(),
            waited
        );
    }

    let b_smi = hw3d.mmap(&b, PID_B, RegionId::Smi.map_offset(), smi_len)?;
    let seen = platform
        .read_mapping(b_smi.handle, 0, 14)
        .context("B's SMI mapping vanished")?;
    if seen.iter().all(|&byte| byte == 0) {
        println!("{} B's SMI window is zeroed", "✓".green());
    } else {
        anyhow::bail!("B can read A's data: {:?}", String::from_utf8_lossy(&seen));
    }

    let status = hw3d.status();
    println!(
        "\nState {:?}, owner {}, flags {:?}",
        status.state,
        status
            .owner
            .map_or_else(|| "none".to_string(), |pid| pid.to_string()),
        status.flags
    );

    hw3d.flush(&b);
    hw3d.release(&b);
    Ok(())
}

fn run_irq(board: &BoardFile, count: u32) -> anyhow::Result<()> {
    let (_platform, hw3d) = probe(board, board.driver.clone())?;
    let master = hw3d.open(Role::Master, PID_MASTER)?;

    println!("{} Firing {} interrupts with nobody waiting", "▶".green(), count);
    for _ in 0..count {
        hw3d.handle_irq();
    }

    hw3d.ioctl(&master, PID_MASTER, Hw3dCommand::WaitForInterrupt)?;
    println!("{} First wait returned at once", "✓".green());

    let waiter = {
        let hw3d = Arc::clone(&hw3d);
        let master = Arc::clone(&master);
        thread::spawn(move || hw3d.ioctl(&master, PID_MASTER, Hw3dCommand::WaitForInterrupt))
    };

    thread::sleep(Duration::from_millis(50));
    if waiter.is_finished() {
        anyhow::bail!("second wait did not block; interrupts were not coalesced");
    }
    println!(
        "{} Second wait blocks: {} interrupts coalesced into one",
        "✓".green(),
        count
    );

    hw3d.handle_irq();
    waiter
        .join()
        .map_err(|_| anyhow::anyhow!("waiter thread panicked"))??;
    println!("{} Next interrupt wakes the waiter", "✓".green());

    hw3d.release(&master);
    Ok(())
}
