use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ema_sort::{
    check_sorted, generate_random_file, CacheConfig, CheckOutcome, ExternalSorterBuilder,
    ELEMENT_BYTES,
};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    match arg_parser.subcommand() {
        Some(("generate", args)) => run_generate(args),
        Some(("sort", args)) => run_sort(args),
        Some(("check", args)) => run_check(args),
        _ => unreachable!("subcommand is required"),
    }
}

fn run_generate(args: &clap::ArgMatches) {
    let file = args.value_of("file").expect("value is required");
    let size = args.value_of("size").expect("value is required");
    let bytes = size.parse::<ByteSize>().expect("value is pre-validated").as_u64();
    let elements = bytes / ELEMENT_BYTES as u64;

    let generated = generate_random_file(
        path::Path::new(file),
        elements,
        &mut rand::thread_rng(),
        CacheConfig::default(),
    );
    if let Err(err) = generated {
        log::error!("file generation error: {}", err);
        process::exit(1);
    }

    println!("random file generated: {} ({} elements)", file, elements);
}

fn run_sort(args: &clap::ArgMatches) {
    let input = args.value_of("input").expect("value is required");
    let output = args.value_of("output").expect("value is required");
    let threads: Option<usize> = args
        .is_present("threads")
        .then(|| args.value_of_t_or_exit("threads"));
    let chunk_size = args.value_of("chunk_size").map(|value| {
        let bytes = value.parse::<ByteSize>().expect("value is pre-validated").as_u64();
        (bytes / ELEMENT_BYTES as u64).max(1) as usize
    });

    let mut sorter_builder = ExternalSorterBuilder::new();
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }
    if let Some(tmp_dir) = args.value_of("tmp_dir") {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }
    if let Some(chunk_size) = chunk_size {
        sorter_builder = sorter_builder.with_chunk_size(chunk_size);
    }

    let sorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    match sorter.sort(path::Path::new(input), path::Path::new(output)) {
        Ok(total) => println!("sorted {} elements into {}", total, output),
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

fn run_check(args: &clap::ArgMatches) {
    let file = args.value_of("file").expect("value is required");

    match check_sorted(path::Path::new(file), CacheConfig::default()) {
        Ok(CheckOutcome::Sorted) => println!("file is sorted"),
        Ok(CheckOutcome::NotSorted { index, value, prev }) => {
            println!(
                "file is not sorted: element {} is {:#x} after {:#x}",
                index, value, prev
            )
        }
        Err(err) => {
            log::error!("sortedness check error: {}", err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ema-sort")
        .about("external merge sort for fixed-width integers")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values())
                .global(true),
        )
        .subcommand(
            clap::App::new("generate")
                .about("generate a random binary file of 32-bit values")
                .arg(
                    clap::Arg::new("file")
                        .help("output file")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("size")
                        .help("file size (e.g. 256MiB)")
                        .required(true)
                        .takes_value(true)
                        .validator(validate_size),
                ),
        )
        .subcommand(
            clap::App::new("sort")
                .about("sort a file of 32-bit values")
                .arg(
                    clap::Arg::new("input")
                        .help("file to be sorted")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("output")
                        .help("result file")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("chunk_size")
                        .short('c')
                        .long("chunk-size")
                        .help("chunk size for the external sort (e.g. 32MiB); omit to sort in memory")
                        .takes_value(true)
                        .validator(validate_size),
                )
                .arg(
                    clap::Arg::new("threads")
                        .short('t')
                        .long("threads")
                        .help("number of threads to use for parallel chunk sorting")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("tmp_dir")
                        .short('d')
                        .long("tmp-dir")
                        .help("directory to be used to store temporary data")
                        .takes_value(true),
                ),
        )
        .subcommand(
            clap::App::new("check")
                .about("check that a file of 32-bit values is sorted")
                .arg(
                    clap::Arg::new("file")
                        .help("file to be checked")
                        .required(true)
                        .takes_value(true),
                ),
        )
        .get_matches()
}

fn validate_size(value: &str) -> Result<(), String> {
    match value.parse::<ByteSize>() {
        Ok(_) => Ok(()),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
