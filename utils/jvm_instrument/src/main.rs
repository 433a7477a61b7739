use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use clap::Parser;
use libafl_jvm::{
    CallSiteFilter, ClassReport, CoverageMapTarget, CoverageState, EdgeCoverageInstrumentor,
    Error, InstrumentationMode, NoThrowTable, PackagePrefixes,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[command(
    name = "jvm_instrument",
    about,
    long_about = "Adds edge coverage probes to JVM class files"
)]
pub struct Opt {
    #[arg(short, long, help = "Class files, or directories searched for them", num_args = 1.., required = true)]
    pub inputs: Vec<PathBuf>,

    #[arg(short, long, help = "Directory the instrumented classes are written to")]
    pub output: PathBuf,

    #[arg(
        long,
        help = "No-throw table, `owner#name#descriptor` lines or a .postcard file"
    )]
    pub no_throw: Option<PathBuf>,

    #[arg(
        long,
        help = "Package prefixes whose calls are never probed",
        default_value = "libafl/jvm/"
    )]
    pub exclude: Vec<String>,

    #[arg(long, help = "Internal name of the coverage map class")]
    pub map_class: Option<String>,

    #[arg(
        long,
        help = "Testing mode: fixed map size, probes notify the map class"
    )]
    pub testing: bool,

    #[arg(long, help = "Initial number of map counters", default_value_t = libafl_jvm::COVERAGE_MAP_INITIAL_SIZE)]
    pub initial_map_size: usize,

    #[arg(long, help = "Maximum number of map counters", default_value_t = libafl_jvm::COVERAGE_MAP_MAX_SIZE)]
    pub max_map_size: usize,

    #[arg(short, long, help = "Write a JSON report of all probes to this file")]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct Report {
    classes: Vec<ClassReport>,
    edges_allocated: usize,
    map_capacity: usize,
}

fn collect_classes(path: &Path, classes: &mut Vec<PathBuf>) -> Result<(), Error> {
    if path.is_dir() {
        let mut entries = fs::read_dir(path)
            .map_err(|err| Error::os_error(err, format!("listing {}", path.display())))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort();
        for entry in entries {
            collect_classes(&entry, classes)?;
        }
    } else if path.extension().is_some_and(|ext| ext == "class") {
        classes.push(path.to_path_buf());
    }
    Ok(())
}

fn run(opts: &Opt) -> Result<(), Error> {
    let mode = if opts.testing {
        InstrumentationMode::Testing
    } else {
        InstrumentationMode::Production
    };
    let state = match mode {
        InstrumentationMode::Testing => CoverageState::fixed(opts.initial_map_size),
        InstrumentationMode::Production => {
            CoverageState::with_capacity(opts.initial_map_size, opts.max_map_size)
        }
    };
    let no_throw = match &opts.no_throw {
        Some(path) => NoThrowTable::load(path)?,
        None => NoThrowTable::new(),
    };
    log::info!("loaded {} no-throw methods", no_throw.len());

    let filter = CallSiteFilter::new(
        Arc::new(no_throw),
        PackagePrefixes::new(opts.exclude.iter().cloned()),
        mode,
    );
    let target = match &opts.map_class {
        Some(class_name) => CoverageMapTarget::builder()
            .class_name(class_name.as_str())
            .build(),
        None => CoverageMapTarget::default(),
    };
    let instrumentor = EdgeCoverageInstrumentor::builder()
        .state(&state)
        .filter(filter)
        .target(target)
        .build();

    let mut inputs = vec![];
    for input in &opts.inputs {
        collect_classes(input, &mut inputs)?;
    }

    let mut classes = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let bytes = fs::read(input)
            .map_err(|err| Error::os_error(err, format!("reading {}", input.display())))?;
        let (instrumented, report) = instrumentor.instrument_with_report(&bytes)?;

        let out = opts.output.join(format!("{}.class", report.class_name));
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&out, instrumented)
            .map_err(|err| Error::os_error(err, format!("writing {}", out.display())))?;
        println!(
            "{} -> {} ({} probes)",
            input.display(),
            out.display(),
            report.total_probes()
        );
        classes.push(report);
    }

    println!(
        "Instrumented {} classes, {} edges",
        classes.len(),
        state.edges_allocated()
    );

    if let Some(path) = &opts.report {
        let report = Report {
            classes,
            edges_allocated: state.edges_allocated(),
            map_capacity: state.map().capacity(),
        };
        fs::write(path, serde_json::to_vec_pretty(&report)?)
            .map_err(|err| Error::os_error(err, format!("writing {}", path.display())))?;
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let opts = Opt::parse();

    if let Err(err) = run(&opts) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
