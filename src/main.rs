use std::path::Path;
use std::process;
use std::time::Instant;

use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use tracing::{error, info};

use restruc::binary::Image;
use restruc::dumper::Dumper;
use restruc::recontex::Recontex;
use restruc::reflo::Reflo;
use restruc::restruc::Restruc;

fn main() {
    let matches = Command::new("restruc")
        .version("0.1.0")
        .about("Recovers struct layouts from a stripped x86-64 PE binary")
        .arg(
            Arg::new("binary")
                .help("Path to the PE executable to analyze")
                .long_help(
                    "Path to the Windows PE executable that will be analyzed.\n\
                     The file must be a valid x86-64 (PE32+) binary.",
                )
                .required(true)
                .value_name("BINARY_PATH")
                .index(1),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .help("Number of analysis threads")
                .long_help(
                    "Bound on concurrently analyzed functions.\n\
                     Defaults to the available hardware parallelism.",
                )
                .value_name("N")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("dump-flos")
                .long("dump-flos")
                .help("Dump the disassembly of every discovered function to stderr")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose output")
                .long_help(
                    "Increase verbosity level. Use multiple times for more detailed output:\n\
                     -v: Show debug information\n\
                     -vv: Show trace information",
                )
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress non-error output")
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose"),
        )
        .get_matches();

    let level = if matches.get_flag("quiet") {
        tracing::Level::ERROR
    } else {
        match matches.get_count("verbose") {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let binary_path = Path::new(
        matches
            .get_one::<String>("binary")
            .map(String::as_str)
            .unwrap_or_default(),
    );
    let threads = matches
        .get_one::<usize>("threads")
        .copied()
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
    let dump_flos = matches.get_flag("dump-flos");

    if let Err(error) = run(binary_path, threads, dump_flos) {
        error!("{:#}", error);
        process::exit(1);
    }
}

fn run(binary_path: &Path, threads: usize, dump_flos: bool) -> Result<()> {
    info!("loading {}", binary_path.display());
    let image = Image::load(binary_path)?;
    info!(
        "loaded {:.2} MB, {} sections",
        image.bytes().len() as f64 / 1024.0 / 1024.0,
        image.sections().len()
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()?;

    println!("// Reflo::analyze ...");
    let mut reflo = Reflo::new(&image);
    let elapsed = measure(|| reflo.analyze(&pool))?;
    let (lo, hi) = reflo.analyzed_va_bounds().unwrap_or_default();
    println!(
        "// Analyzed: [{:08x}; {:08x}], {} functions in {}ms",
        lo,
        hi,
        reflo.flos().len(),
        elapsed
    );

    if dump_flos {
        let mut dumper = Dumper::new();
        let mut out = String::new();
        for flo in reflo.flos().values() {
            dumper.dump_flo(&mut out, &image, flo);
        }
        eprint!("{}", out);
    }

    println!("// Recontex::analyze ...");
    let mut recontex = Recontex::new(&image);
    let elapsed = measure(|| {
        recontex.analyze(&pool, &mut reflo);
        Ok(())
    })?;
    println!(
        "// Analyzed {} functions in {}ms",
        reflo.flos().len(),
        elapsed
    );

    println!("// Restruc::analyze ...");
    let restruc = Restruc::new(&image);
    let elapsed = measure(|| {
        restruc.analyze(&pool, &reflo, &recontex);
        Ok(())
    })?;
    println!(
        "// Analyzed {} functions in {}ms",
        reflo.flos().len(),
        elapsed
    );
    println!("// Recovered {} structures", restruc.strucs_count());
    println!();

    let mut out = String::new();
    restruc.dump(&mut out);
    print!("{}", out);
    Ok(())
}

fn measure(work: impl FnOnce() -> Result<()>) -> Result<u128> {
    let start = Instant::now();
    work()?;
    Ok(start.elapsed().as_millis())
}
