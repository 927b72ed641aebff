//! Adaptive JIT CLI
//!
//! Runs end-to-end scenarios of the feedback loop and prints configurations.

use adaptive_jit::ic::IcTransition;
use adaptive_jit::jit::{Compilation, Residual, SendResolution};
use adaptive_jit::oop::{ClassId, MethodBuilder, MethodId, Operand};
use adaptive_jit::process::Activation;
use adaptive_jit::recompile::RecompileTrigger;
use adaptive_jit::{LookupKey, Runtime, VmConfig, VERSION};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "adaptive_jit")]
#[command(author, version, about = "Feedback-directed inlining and deoptimization playground", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an end-to-end feedback loop scenario
    Scenario {
        #[arg(value_enum)]
        name: Scenario,
    },

    /// Print a configuration as JSON
    Config {
        #[arg(long, value_enum, default_value_t = Preset::Default)]
        preset: Preset,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// A send that never executed compiles to an uncommon trap
    Untaken,
    /// Two receiver classes produce a two-way type case
    Polymorphic,
    /// Too many receiver classes make the site uninlinable
    Megamorphic,
    /// A block whose home activation returned defers to its home method
    NonLifoBlock,
    /// Repeated traps recompile and back off the invocation limit
    TrapBackoff,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    Default,
    Conservative,
    Aggressive,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Config { preset } => {
            let config = match preset {
                Preset::Default => VmConfig::default(),
                Preset::Conservative => VmConfig::conservative(),
                Preset::Aggressive => VmConfig::aggressive(),
            };
            println!("{}", config.to_json()?);
        }
        Commands::Scenario { name } => {
            let config = match &cli.config {
                Some(path) => VmConfig::load(path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                None => VmConfig::default(),
            };
            println!("adaptive_jit {}", VERSION);
            run_scenario(name, config)?;
        }
    }
    Ok(())
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ==================== Scenario World ====================

/// `Shape>>area` overridden in several subclasses and `Driver>>run:` which
/// sends `area` to its argument
struct World {
    rt: Runtime,
    shapes: Vec<ClassId>,
    run_key: LookupKey,
    run: MethodId,
}

fn world(config: VmConfig, shape_count: usize) -> anyhow::Result<World> {
    let mut rt = Runtime::with_config(config).context("invalid configuration")?;
    let classes = rt.classes_mut();
    let shape = classes.define_class("Shape", None);
    let driver = classes.define_class("Driver", None);
    let area = classes.intern("area");
    let run_sel = classes.intern("run:");

    let mut shapes = Vec::with_capacity(shape_count);
    for i in 0..shape_count {
        let class = classes.define_class(&format!("Shape{}", i), Some(shape));
        classes.add_method(class, MethodBuilder::new(area).work(2 + i as u32))?;
        shapes.push(class);
    }
    let run = classes.add_method(
        driver,
        MethodBuilder::new(run_sel)
            .args(1)
            .work(1)
            .send(area, Operand::Arg(0), vec![]),
    )?;
    Ok(World {
        rt,
        shapes,
        run_key: LookupKey::new(driver, run_sel),
        run,
    })
}

// ==================== Scenarios ====================

fn run_scenario(name: Scenario, config: VmConfig) -> anyhow::Result<()> {
    match name {
        Scenario::Untaken => untaken(config),
        Scenario::Polymorphic => observed(config, 2),
        Scenario::Megamorphic => {
            let classes = config.ic.max_entries + 1;
            observed(config, classes)
        }
        Scenario::NonLifoBlock => non_lifo_block(config),
        Scenario::TrapBackoff => trap_backoff(config),
    }
}

fn untaken(config: VmConfig) -> anyhow::Result<()> {
    let mut w = world(config, 1)?;
    w.rt.link_method(w.run)?;
    report(&w.rt, w.run, w.run_key)?;
    Ok(())
}

fn observed(config: VmConfig, classes: usize) -> anyhow::Result<()> {
    let mut w = world(config, classes)?;
    println!("--- Sends ---");
    for &class in &w.shapes {
        let transition = w.rt.send_interpreted(w.run, 1, class)?;
        println!("  {} -> {}", w.rt.classes().class_name(class), describe_transition(&transition));
    }
    report(&w.rt, w.run, w.run_key)?;
    Ok(())
}

fn non_lifo_block(config: VmConfig) -> anyhow::Result<()> {
    let mut w = world(config, 1)?;
    let value = w.rt.classes_mut().intern("value");
    let block = w.rt.classes_mut().add_block(w.run, MethodBuilder::new(value).work(3))?;
    let block_key = LookupKey::for_method(w.rt.classes().well_known().block_closure, block);

    // The block outlives the activation of run: that created its context
    let processes = w.rt.processes_mut();
    let context = processes.new_context(w.run, false);
    let pid = processes.spawn();
    let index = processes.push_frame(pid, Activation::interpreted(block_key, block).block_in(Some(context)))?;

    let outcome = w.rt.recompile(pid, index, RecompileTrigger::CounterOverflow)?;
    println!("--- Recompilation ---");
    println!("  block {} -> {:?}", block.0, outcome);
    println!("  home counter: {}", w.rt.invocation_count(w.run));
    Ok(())
}

fn trap_backoff(config: VmConfig) -> anyhow::Result<()> {
    let threshold = config.trap.recompile_threshold;
    let mut w = world(config, 1)?;
    w.rt.link_method(w.run)?;
    let nm = w.rt.compile(w.run_key)?;
    if w.rt.code().checked(nm)?.traps.is_empty() {
        bail!("compiled code has no uncommon trap");
    }

    println!("--- Traps ---");
    for _ in 0..threshold {
        let Some(current) = w.rt.code().current(&w.run_key) else {
            break;
        };
        let pid = w.rt.processes_mut().spawn();
        let index = w
            .rt
            .processes_mut()
            .push_frame(pid, Activation::compiled(w.run_key, w.run, current, 0))?;
        let report = w.rt.uncommon_trap(pid, index, 0)?;
        println!(
            "  nm {}: {:?}, trap count {}, recompile {:?}",
            current.0, report.outcome.patch, report.outcome.trap_count, report.recompile
        );
    }

    let backoff = w.rt.trap_history().backoff(&w.run_key);
    println!("--- Backoff ---");
    println!("  exponent: {}", backoff);
    println!("  invocation limit: {}", w.rt.config().effective_invocation_limit(backoff));
    println!("  disabled sites: {}", w.rt.trap_history().disabled_count());
    if let Some(current) = w.rt.code().current(&w.run_key) {
        let nm = w.rt.code().checked(current)?;
        println!("  current code: nm {} (version {}, level {})", nm.id.0, nm.version, nm.level);
    }
    Ok(())
}

// ==================== Reporting ====================

fn report(rt: &Runtime, method: MethodId, key: LookupKey) -> anyhow::Result<()> {
    println!("--- Inline caches ---");
    for (bci, cache) in rt.caches().sites(method) {
        println!(
            "  bci {}: {:?}, {} targets, flags {:?}",
            bci,
            cache.state(),
            cache.number_of_targets(),
            cache.flags()
        );
    }

    println!("--- Scope tree ---");
    print!("{}", rt.scope_tree(key)?.render(rt.classes()));

    let compilation = rt.prepare(key, 1)?;
    println!("--- Resolutions ---");
    print_resolutions(rt, &compilation);
    print!("{}", compilation);
    Ok(())
}

fn print_resolutions(rt: &Runtime, compilation: &Compilation) {
    let classes = rt.classes();
    for node in &compilation.graph.sends {
        let what = match &node.resolution {
            SendResolution::Inlined { class, .. } => format!("inlined for {}", classes.class_name(*class)),
            SendResolution::RealSend(send) => format!("real send {:?}", send.flags),
            SendResolution::UncommonTrap(_) => "uncommon trap".to_string(),
            SendResolution::TypeCase { arms, residual } => {
                let names: Vec<&str> = arms.iter().map(|a| classes.class_name(a.class)).collect();
                let otherwise = match residual {
                    Residual::Send(send) => format!("real send {:?}", send.flags),
                    Residual::Trap(_) => "uncommon trap".to_string(),
                };
                format!("type case [{}] else {}", names.join(", "), otherwise)
            }
        };
        println!(
            "  scope {} bci {} #{}: {}",
            node.scope.0,
            node.bci,
            classes.selector_name(node.selector),
            what
        );
    }
}

fn describe_transition(transition: &IcTransition) -> &'static str {
    match transition {
        IcTransition::Hit(_) => "hit",
        IcTransition::Filled(_) => "filled (monomorphic)",
        IcTransition::Grown(_) => "grown (polymorphic)",
        IcTransition::WentMegamorphic(_) => "went megamorphic",
        IcTransition::MegamorphicLookup(_) => "megamorphic lookup",
        IcTransition::NotUnderstood => "not understood",
        IcTransition::Fallback(_) => "fallback",
    }
}
