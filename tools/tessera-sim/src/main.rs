//! Tessera PCI enable simulator.
//!
//! Loads a topology file, builds the device table and a simulated
//! configuration space from it, and either prints the topology or runs its
//! step script through the enable engine.
//!
//! Pipeline: read TOML → build `SimBus` + `DeviceTable` → run steps →
//!           print per-device state.

mod cli;
mod topology;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use tessera_pci::logger;
use tessera_pci::resource::ResourceKind;

use crate::topology::{Op, Step, Topology};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    init_logging(cli.quiet, cli.verbose)?;

    match cli.command {
        cli::Command::Show(ref args) => cmd_show(&Topology::load(&args.topology)?),
        cli::Command::Run(ref args) => cmd_run(&Topology::load(&args.topology)?),
    }
    Ok(())
}

fn stderr_sink(record: &log::Record<'_>) {
    eprintln!("[{:<5}] {}", record.level(), record.args());
}

fn init_logging(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        LevelFilter::Error
    } else if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    logger::set_sink(stderr_sink);
    logger::init(level).context("installing logger")
}

// ===========================================================================
// show
// ===========================================================================

fn cmd_show(topo: &Topology) {
    let table = topo.enabler.devices();
    for (id, dev) in table.iter() {
        let parent = table
            .parent(id)
            .map_or_else(|| "-".to_owned(), |p| topo.name(p).to_owned());
        println!(
            "{} {:<16} parent={parent}{}",
            dev.address(),
            topo.name(id),
            if dev.is_bridge() { " bridge" } else { "" }
        );

        for (index, res) in dev.resources().iter() {
            let kind = match res.kind() {
                ResourceKind::Memory => "mem",
                ResourceKind::Io => "io ",
                ResourceKind::Unused => continue,
            };
            let end = res.start().wrapping_add(res.size()).wrapping_sub(1);
            let mut state = Vec::new();
            if res.is_unset() {
                state.push("unset");
            }
            if !res.is_claimed() {
                state.push("unclaimed");
            }
            if index.is_rom() && res.rom_enabled() {
                state.push("rom-enabled");
            }
            println!(
                "    {:<5} {kind} {:#010x}-{end:#010x} {}",
                index.to_string(),
                res.start(),
                state.join(",")
            );
        }
    }
}

// ===========================================================================
// run
// ===========================================================================

fn cmd_run(topo: &Topology) {
    for (i, step) in topo.steps.iter().enumerate() {
        let outcome = match apply(topo, *step) {
            Ok(()) => "ok".to_owned(),
            Err(err) => format!("error: {err}"),
        };
        println!(
            "step {:>2}: {:<12} {:<16} {outcome}",
            i + 1,
            step.op.to_string(),
            topo.name(step.device)
        );
    }

    println!();
    println!(
        "{:<16} {:<8} {:>5} {:>7} {:>6}",
        "DEVICE", "ADDRESS", "COUNT", "COMMAND", "MASTER"
    );
    let bus = topo.enabler.transport();
    for (id, dev) in topo.enabler.devices().iter() {
        let command = bus
            .command(dev.address())
            .map_or_else(|| "----".to_owned(), |cmd| format!("{:04x}", cmd.bits()));
        println!(
            "{:<16} {:<8} {:>5} {:>7} {:>6}",
            topo.name(id),
            dev.address().to_string(),
            dev.enable_count().get(),
            command,
            if dev.is_busmaster() { "yes" } else { "no" }
        );
    }
}

fn apply(topo: &Topology, step: Step) -> Result<(), tessera_pci::EnableError> {
    let enabler = &topo.enabler;
    let id = step.device;
    match step.op {
        Op::Enable => enabler.enable_device(id),
        Op::EnableMem => enabler.enable_device_mem(id),
        Op::EnableIo => enabler.enable_device_io(id),
        Op::Disable => enabler.disable_device(id),
        Op::Reenable => enabler.reenable_device(id),
        Op::SetMaster => enabler.set_master(id, true),
        Op::ClearMaster => enabler.set_master(id, false),
        Op::Disconnect => {
            enabler.device(id)?.set_disconnected();
            Ok(())
        }
    }
}
