use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

use kbit::membership;
use kbit::KbitError;
use kbit::{decode_kmer, splitmix64};
use kbit::{GcHistogram, KbitHeader, ShardIndex, StreamEngine, StreamParams};

use rand_chacha::rand_core::{RngCore, SeedableRng};

fn stream_command(matches: &clap::ArgMatches) -> kbit::Result<()> {
    let shards_dir = matches.get_one::<PathBuf>("shards").unwrap();
    let gc_hist_path = matches.get_one::<PathBuf>("gc-hist").unwrap();

    let params = StreamParams {
        construct_k: matches.get_one::<u64>("construct_k").copied(),
        gc_min_pct: *matches.get_one::<u32>("gc-min").unwrap(),
        gc_max_pct: *matches.get_one::<u32>("gc-max").unwrap(),
        substring: matches.get_one::<String>("substring").cloned(),
        reverse_complement: matches.get_flag("reverse_complement"),
        limit: *matches.get_one::<u64>("limit").unwrap(),
        threads: *matches.get_one::<usize>("threads").unwrap(),
        window: *matches.get_one::<u16>("window").unwrap(),
        burst: *matches.get_one::<u16>("burst").unwrap(),
        // Tiny chunks only add refill rounds; 16 is the useful floor.
        refill_chunk: (*matches.get_one::<u32>("refill_chunk").unwrap()).max(16),
        random_access: matches.get_flag("random_access"),
        ra_seed: matches
            .get_one::<u64>("ra_seed")
            .copied()
            .unwrap_or_else(|| splitmix64(rand::random::<u64>())),
        cursor: matches.get_one::<String>("cursor").cloned(),
    };

    let index = ShardIndex::load(shards_dir)?;
    let gc_hist = GcHistogram::load(gc_hist_path)?;

    log::info!(
        "k={} num_shards={} window={} burst={} limit={}",
        index.k,
        index.num_shards(),
        params.window,
        params.burst,
        params.limit
    );

    let engine = StreamEngine::new(index, &gc_hist, params)?;
    let seed = engine.seed();
    let page = engine.run()?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let emit = |out: &mut dyn Write| -> io::Result<()> {
        writeln!(
            out,
            "__META__\t{}\t{}\t{}\t{}",
            page.cursor.as_deref().unwrap_or(""),
            if page.has_more { '1' } else { '0' },
            page.keys.len(),
            page.kout
        )?;
        for &v in &page.keys {
            out.write_all(decode_kmer(v, page.kout as usize).as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()
    };
    emit(&mut out).map_err(|e| KbitError::BadInput(format!("cannot write output: {}", e)))?;

    if seed != 0 {
        log::info!("permutation seed: {}", seed);
    }
    log::info!(
        "returned {} k-mers, has_more={}, {} shards loaded, scan {:.3} s",
        page.keys.len(),
        page.has_more,
        page.shards_loaded,
        page.scan_seconds
    );
    Ok(())
}

fn read_kmer_lines(path: Option<&PathBuf>) -> kbit::Result<Vec<String>> {
    let reader: Box<dyn BufRead> = match path {
        Some(p) => Box::new(io::BufReader::new(File::open(p).map_err(|e| {
            KbitError::BadInput(format!("cannot open {}: {}", p.display(), e))
        })?)),
        None => {
            log::info!("reading k-mers from stdin, one per line");
            Box::new(io::BufReader::new(io::stdin()))
        }
    };

    let mut kmers = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| KbitError::BadInput(format!("cannot read input: {}", e)))?;
        let trimmed = line.trim_end_matches('\r');
        if !trimmed.is_empty() {
            kmers.push(trimmed.to_string());
        }
    }
    Ok(kmers)
}

fn lookup_command(matches: &clap::ArgMatches) -> kbit::Result<()> {
    let shards_dir = matches.get_one::<PathBuf>("shards");
    let bitmap_path = matches.get_one::<PathBuf>("bitmap");
    let expect_k = matches.get_one::<u64>("k").copied();
    let threads = *matches.get_one::<usize>("threads").unwrap();

    let kmers = read_kmer_lines(matches.get_one::<PathBuf>("kmers"))?;

    let hits = match (shards_dir, bitmap_path) {
        (Some(dir), _) => {
            let index = ShardIndex::load(dir)?;
            membership::check_query_k(index.k, expect_k)?;
            membership::query_sharded(&index, &kmers, threads)?
        }
        (None, Some(path)) => membership::query_single(path, expect_k, &kmers)?,
        (None, None) => unreachable!("clap requires one of --shards/--bitmap"),
    };

    let mut out: Box<dyn Write> = match matches.get_one::<PathBuf>("out") {
        Some(p) => Box::new(BufWriter::new(File::create(p).map_err(|e| {
            KbitError::BadInput(format!("cannot create {}: {}", p.display(), e))
        })?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let mut line = String::with_capacity(32);
    for (kmer, hit) in kmers.iter().zip(&hits) {
        line.clear();
        line.push_str(kmer);
        line.push('\t');
        line.push(if *hit { '1' } else { '0' });
        line.push('\n');
        out.write_all(line.as_bytes())
            .map_err(|e| KbitError::BadInput(format!("cannot write output: {}", e)))?;
    }
    out.flush()
        .map_err(|e| KbitError::BadInput(format!("cannot write output: {}", e)))?;

    log::info!("queried {} k-mers", kmers.len());
    Ok(())
}

fn gen_command(matches: &clap::ArgMatches) -> kbit::Result<()> {
    let k = *matches.get_one::<u64>("k").unwrap();
    let percent = *matches.get_one::<f64>("percent").unwrap();
    let out_path = matches.get_one::<PathBuf>("out").unwrap();
    let seed = matches
        .get_one::<u64>("seed")
        .copied()
        .unwrap_or_else(rand::random);

    if !(1..=31).contains(&k) {
        return Err(KbitError::BadInput("--k must be in [1, 31]".to_string()));
    }
    if !(0.0..=100.0).contains(&percent) {
        return Err(KbitError::BadInput(
            "--percent must be in [0, 100]".to_string(),
        ));
    }

    let total_bits = kbit::universe_bits(k);
    let payload_len = total_bits.div_ceil(8);
    let ones = (((percent / 100.0) * total_bits as f64).round() as u64).min(total_bits);

    let file = File::create(out_path)
        .map_err(|e| KbitError::BadInput(format!("cannot create {}: {}", out_path.display(), e)))?;
    let mut out = BufWriter::with_capacity(1 << 20, file);

    let header = KbitHeader {
        total_bits,
        ones,
        k,
        seed,
        flags: kbit::FLAG_DENSE,
        payload_len,
    };
    let io_err =
        |e: io::Error| KbitError::BadInput(format!("cannot write {}: {}", out_path.display(), e));
    header.write_to(&mut out).map_err(io_err)?;

    log::info!(
        "k={} total_bits={} ones={} ({}%) seed={}",
        k,
        total_bits,
        ones,
        percent,
        seed
    );

    // Selection sampling: each remaining key becomes a one with
    // probability needed/remaining, which lands on exactly `ones` set
    // bits by the time the universe is exhausted.
    let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(seed);
    let mut remaining = total_bits;
    let mut needed = ones;
    while remaining > 0 {
        let bits_here = remaining.min(8);
        let mut byte = 0u8;
        for b in 0..bits_here {
            if needed > 0 {
                let pick = ((rng.next_u64() as u128 * remaining as u128) >> 64) as u64;
                if pick < needed {
                    byte |= 1 << b;
                    needed -= 1;
                }
            }
            remaining -= 1;
        }
        out.write_all(&[byte]).map_err(io_err)?;
    }
    out.flush().map_err(io_err)?;

    log::info!(
        "wrote {} payload bytes to {}",
        payload_len,
        out_path.display()
    );
    Ok(())
}

fn main() {
    let cli = clap::Command::new("kbit")
        .about("Query tools for sharded KBITv1 k-mer bitmap databases.")
        .arg_required_else_help(true)
        .arg(
            clap::Arg::new("threads")
                .help("Number of worker threads")
                .long("threads")
                .short('t')
                .default_value("4")
                .global(true)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            clap::Arg::new("verbose")
                .help("Print more information when running.")
                .short('v')
                .long("verbose")
                .global(true)
                .action(clap::ArgAction::SetTrue),
        )
        .subcommand(
            clap::Command::new("stream")
                .about("Windowed streaming search for absent k-mers under GC and substring filters.")
                .arg_required_else_help(true)
                .arg(
                    clap::Arg::new("shards")
                        .help("Shard directory containing index.json")
                        .long("shards")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    clap::Arg::new("gc-hist")
                        .help("Per-shard GC histogram JSON for this database")
                        .long("gc-hist")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    clap::Arg::new("substring")
                        .help("Require this DNA substring to occur in every emitted k-mer")
                        .long("substring")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    clap::Arg::new("reverse_complement")
                        .help("Also accept the reverse complement of --substring")
                        .long("reverse_complement")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    clap::Arg::new("gc-min")
                        .help("Minimum GC percentage, 0..100")
                        .long("gc-min")
                        .default_value("0")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    clap::Arg::new("gc-max")
                        .help("Maximum GC percentage, 0..100")
                        .long("gc-max")
                        .default_value("100")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    clap::Arg::new("limit")
                        .help("Maximum k-mers per page")
                        .long("limit")
                        .default_value("200")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    clap::Arg::new("construct_k")
                        .help("Output k-mer length; > 18 expands absent 18-mer anchors")
                        .long("construct_k")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    clap::Arg::new("window")
                        .help("Number of shards scanned concurrently")
                        .long("window")
                        .default_value("16")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    clap::Arg::new("burst")
                        .help("Keys emitted per lane per interleave round")
                        .long("burst")
                        .default_value("1")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    clap::Arg::new("refill_chunk")
                        .help("Per-lane buffer refill size")
                        .long("refill_chunk")
                        .default_value("256")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    clap::Arg::new("cursor")
                        .help("Resume cursor returned by a previous page")
                        .long("cursor")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    clap::Arg::new("random_access")
                        .help("Visit shards in a seeded pseudorandom order")
                        .long("random_access")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    clap::Arg::new("ra_seed")
                        .help("Permutation seed for --random_access (random if omitted)")
                        .long("ra_seed")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            clap::Command::new("lookup")
                .about("Membership lookup: prints \"<kmer>\\t<0|1>\" per input k-mer, in input order.")
                .arg_required_else_help(true)
                .arg(
                    clap::Arg::new("shards")
                        .help("Shard directory containing index.json")
                        .long("shards")
                        .required_unless_present("bitmap")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    clap::Arg::new("bitmap")
                        .help("Single KBITv1 bitmap file (legacy mode)")
                        .long("bitmap")
                        .conflicts_with("shards")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    clap::Arg::new("k")
                        .help("Require the database k to be exactly this")
                        .long("k")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    clap::Arg::new("kmers")
                        .help("File with one k-mer per line; stdin if omitted")
                        .long("kmers")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    clap::Arg::new("out")
                        .help("Output file; stdout if omitted")
                        .long("out")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            clap::Command::new("gen")
                .about("Write a dense KBITv1 bitmap of 4^k bits with an exact percentage of ones.")
                .arg_required_else_help(true)
                .arg(
                    clap::Arg::new("k")
                        .help("k-mer length, 1..=31")
                        .long("k")
                        .required(true)
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    clap::Arg::new("percent")
                        .help("Percentage of keys set, 0..100")
                        .long("percent")
                        .required(true)
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    clap::Arg::new("out")
                        .help("Output file")
                        .long("out")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    clap::Arg::new("seed")
                        .help("Sampling seed (random if omitted)")
                        .long("seed")
                        .value_parser(clap::value_parser!(u64)),
                ),
        );

    let matches = cli.get_matches();

    let mut builder = env_logger::builder();
    if matches.get_flag("verbose") {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    };
    builder.format(|buf, record| {
        let style = buf.default_level_style(record.level());
        let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let module = record.module_path().unwrap_or("unknown");
        writeln!(
            buf,
            "[{}] [{}] [{}]: {}",
            style.value(record.level().as_str()),
            time,
            module,
            record.args()
        )
    });
    builder.init();

    let result = match matches.subcommand() {
        Some(("stream", sub_matches)) => stream_command(sub_matches),
        Some(("lookup", sub_matches)) => lookup_command(sub_matches),
        Some(("gen", sub_matches)) => gen_command(sub_matches),
        _ => unreachable!(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
