use clap::Parser as ClapParser;
use std::{io, process};

use psvm::{Object, Scheduler, Vm, VmCreateInfo, VmError};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Worker contexts to fork
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..=32))]
    workers: u32,

    /// Each worker sums the integers 1..=terms, yielding between additions
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..=400))]
    terms: u32,

    #[arg(long, help = "Free list misses before a collection is requested")]
    gc_period: Option<u32>,

    #[arg(long, help = "Objects per stack segment")]
    segment_size: Option<usize>,

    #[arg(long, help = "Upper bound for every arena in bytes")]
    max_arena_size: Option<u32>,

    #[arg(long, help = "Log filter, e.g. `info` or `psvm=trace`; overrides RUST_LOG")]
    log_level: Option<String>,
}

/// `mark 1 .. n {add yield ..} fork` per worker, then every handle is joined
/// in fork order and its sum printed.
fn build_program(vm: &mut Vm, workers: u32, terms: u32) -> Result<Object, VmError> {
    let mut keep = Vec::new();

    let mut worker = Vec::new();
    for _ in 1..terms {
        worker.push(vm.word("add"));
        worker.push(vm.word("yield"));
    }
    let body = vm.global.new_proc(&worker, &keep)?;
    keep.push(body);

    let mut root = Vec::new();
    for _ in 0..workers {
        root.push(vm.word("mark"));
        root.extend((1..=terms).map(|term| Object::int(term as i32)));
        root.push(body);
        root.push(vm.word("fork"));
    }
    for k in 0..workers {
        root.push(Object::int((workers - 1 - k) as i32));
        root.extend(["index", "join", "==", "pop"].map(|word| vm.word(word)));
    }
    root.push(vm.word("vmstatus"));
    vm.global.new_proc(&root, &keep)
}

fn run(cli: &Cli) -> Result<(), VmError> {
    let info = VmCreateInfo {
        gc_period: cli.gc_period,
        segment_size: cli.segment_size,
        max_arena_size: cli.max_arena_size,
        ..Default::default()
    };
    let mut vm = Vm::new(&info)?;
    let program = build_program(&mut vm, cli.workers, cli.terms)?;

    let mut host = Scheduler::new();
    let root = host.spawn(&vm, program)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    host.run(&mut vm, &mut out)?;

    let context = host.context(root).ok_or(VmError::InvalidContext)?;
    let status: Vec<_> = context
        .stacks
        .operands
        .iter()
        .rev()
        .take(3)
        .filter_map(|obj| obj.as_int())
        .collect();
    if let [max, used, level] = status[..] {
        println!("local vm: level {level}, {used} of {max} bytes");
    }
    println!(
        "global vm: {} of {} bytes, {} entities",
        vm.global.arena().used(),
        vm.global.arena().max(),
        vm.global.entity_count()
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(filters) = &cli.log_level {
        logger.parse_filters(filters);
    }
    logger.init();

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
