use clap::{Parser as ClapParser, ValueEnum};
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use runtime::{
    Arity, CallKind, DispatchSettings, Fault, PermitMode, Runtime, RuntimeCreateInfo,
    ThreadSettings, Value, Visibility,
};

const EXIT_FAULT: i32 = 70;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Permit {
    Parallel,
    Global,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Worker threads dispatching through shared call sites
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Safepoints requested by the main thread
    #[arg(short, long, default_value_t = 50)]
    safepoints: usize,

    /// Distinct receiver classes the workers rotate through
    #[arg(long, default_value_t = 4)]
    shapes: usize,

    /// Dispatches per worker
    #[arg(short, long, default_value_t = 100_000)]
    iterations: u64,

    /// Cache entries per call site before it degrades
    #[arg(long, default_value_t = DispatchSettings::default().max_chain_length)]
    max_chain: usize,

    #[arg(long, value_enum, default_value_t = Permit::Parallel)]
    permit: Permit,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();

    let info = RuntimeCreateInfo {
        dispatch: DispatchSettings {
            max_chain_length: cli.max_chain,
        },
        threads: ThreadSettings {
            permit: match cli.permit {
                Permit::Parallel => PermitMode::Parallel,
                Permit::Global => PermitMode::Global,
            },
        },
    };
    let rt = match Runtime::new(info) {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("{err}");
            process::exit(2);
        }
    };
    rt.faults().set_handler(Arc::new(|fault: &Fault| {
        eprintln!("fatal: {fault}");
        process::exit(EXIT_FAULT);
    }));

    let universe = rt.universe();
    let value = universe.selector("value");
    let classes: Vec<_> = (0..cli.shapes.max(1))
        .map(|i| {
            let class = universe.define_class(&format!("Shape{i}"), None);
            class.define_method(
                value.clone(),
                Visibility::Public,
                Arity::Exact(0),
                move |_, _| Ok(Value::Integer(i as i64)),
            );
            class
        })
        .collect();
    let receivers: Arc<Vec<Value>> =
        Arc::new(classes.iter().map(|c| universe.instantiate(c)).collect());
    let site = rt.new_call_site("value", CallKind::Public);
    let redefinitions = Arc::new(AtomicU64::new(0));

    let started = Instant::now();
    let workers: Vec<_> = (0..cli.threads)
        .map(|i| {
            let receivers = receivers.clone();
            let iterations = cli.iterations;
            rt.spawn(&format!("worker-{i}"), move |proxy| {
                let mut sum = 0i64;
                for n in 0..iterations {
                    let receiver = &receivers[(n as usize + i) % receivers.len()];
                    match proxy.call(site, receiver, &[]) {
                        Ok(Value::Integer(v)) => sum = sum.wrapping_add(v),
                        Ok(other) => log::warn!("unexpected result {other}"),
                        Err(err) => {
                            log::error!("worker-{i}: {err}");
                            break;
                        }
                    }
                    if n % 1024 == 0 {
                        if let Err(err) = proxy.yield_permit() {
                            log::error!("worker-{i}: {err}");
                            break;
                        }
                    }
                }
                sum
            })
        })
        .collect::<Result<_, _>>()
        .unwrap_or_else(|err| {
            eprintln!("failed to spawn worker: {err}");
            process::exit(1);
        });

    let main = match rt.attach_thread("main") {
        Ok(proxy) => proxy,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };
    let main_id = main.thread().id();
    for round in 0..cli.safepoints {
        let target = classes[round % classes.len()].clone();
        let value = value.clone();
        let redefinitions = redefinitions.clone();
        let result = main.pause_all_threads_and_execute(move |thread| {
            if thread.id() == main_id {
                let base = round as i64;
                target.define_method(
                    value.clone(),
                    Visibility::Public,
                    Arity::Exact(0),
                    move |_, _| Ok(Value::Integer(base)),
                );
                redefinitions.fetch_add(1, Ordering::Relaxed);
            }
        });
        if let Err(err) = result {
            eprintln!("safepoint {round} failed: {err}");
            process::exit(EXIT_FAULT);
        }
        if let Err(err) = main.yield_permit() {
            eprintln!("after safepoint {round}: {err}");
            process::exit(EXIT_FAULT);
        }
    }

    let results = main.blocking(|| {
        workers
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    });
    let elapsed = started.elapsed();
    drop(main);

    let mut failed = 0;
    match results {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        eprintln!("worker failed to attach: {err}");
                        failed += 1;
                    }
                    Err(_) => failed += 1,
                }
            }
        }
        Err(err) => {
            eprintln!("main thread left a failed safepoint: {err}");
            failed += 1;
        }
    }

    let stats = rt.call_site_stats();
    let site_state = rt.call_site(site);
    println!("threads:            {}", cli.threads);
    println!("elapsed:            {elapsed:?}");
    println!("dispatches:         {}", stats.dispatches());
    println!("  hits:             {}", stats.hits);
    println!("  misses:           {}", stats.misses);
    println!("  invalidations:    {}", stats.invalidations);
    println!("  megamorphic:      {}", stats.megamorphic_lookups);
    println!("respecializations:  {}", stats.respecializations);
    println!(
        "safepoints:         {}",
        rt.safepoints().completed_safepoints()
    );
    println!(
        "redefinitions:      {}",
        redefinitions.load(Ordering::Relaxed)
    );
    if let Some(site) = site_state {
        println!(
            "call site:          {} entries, degraded: {}",
            site.cache_len(),
            site.is_degraded()
        );
    }

    if failed > 0 {
        process::exit(1);
    }
}
