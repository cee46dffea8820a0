use std::time::Instant;

use clap::Parser;
use threadctl::{snapshot, Error, Result, Runtime, RuntimeConfig, ThreadController};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "threadctl")]
#[command(about = "Interrupts a sleeping managed thread and dumps the runtime's threads")]
#[command(version)]
struct Args {
    /// How long the sleeper asks to sleep, in milliseconds
    #[arg(long, default_value_t = 5_000)]
    sleep_ms: u64,

    /// Delay before the interrupter fires, in milliseconds
    #[arg(long, default_value_t = 100)]
    delay_ms: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("threadctl=info")),
        )
        .init();

    let rt = Runtime::new(RuntimeConfig::default());

    // Thread A sleeps and reports how the sleep ended.
    let sleeper = rt.create_named_thread("sleeper", {
        let rt = rt.clone();
        let sleep_ms = args.sleep_ms;
        move || {
            let _frame = rt.enter_frame("sleeper::body");
            let started = Instant::now();
            match rt.sleep_current(sleep_ms) {
                Err(Error::Interrupted) => {
                    let me = rt.current_thread();
                    info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        interrupted = rt.is_interrupted(&me, false),
                        "sleep interrupted"
                    );
                    Ok(())
                }
                other => other,
            }
        }
    });
    rt.start(&sleeper)?;

    // Thread B interrupts A while it sleeps.
    let interrupter = rt.spawn("interrupter", {
        let rt = rt.clone();
        let sleeper = sleeper.clone();
        let delay_ms = args.delay_ms;
        move || {
            rt.sleep_current(delay_ms)?;
            let ids = rt.get_threads();
            print!("{}", snapshot::render(&rt.dump_threads(&ids)));
            info!(target_alive = rt.is_alive(&sleeper), "interrupting sleeper");
            rt.interrupt(&sleeper);
            Ok(())
        }
    })?;

    rt.join(&interrupter)?;
    rt.join(&sleeper)?;

    info!(
        alive = rt.is_alive(&sleeper),
        status = ?sleeper.exit_status(),
        live_threads = rt.get_threads().len(),
        "done"
    );
    Ok(())
}
