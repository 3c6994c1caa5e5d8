use std::io::Write;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;

use pystack::{get_stack, thread_state_addr, Error, Pid, TracedProcess};

#[derive(Debug, Parser)]
#[command(
    name = "pystack",
    version,
    disable_version_flag = true,
    about = "Print the current call stack of a running Python process"
)]
struct Args {
    /// Process ID of the target interpreter
    pid: i64,

    /// Sampling period in seconds
    #[arg(short, long, value_name = "RATE", default_value_t = 0.01)]
    rate: f64,

    /// Total sampling duration in seconds; 0 takes a single sample
    #[arg(short, long, value_name = "SECONDS", default_value_t = 0.0)]
    seconds: f64,

    /// Print version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // --help and --version land here and exit zero.
            let code = if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = err.print();
            return code;
        }
    };

    if args.pid < 1 || args.pid > libc::pid_t::MAX as i64 {
        eprintln!("PID {} is out of valid PID range.", args.pid);
        return ExitCode::FAILURE;
    }
    if args.seconds < 0.0 {
        eprintln!("Duration must not be negative.");
        return ExitCode::FAILURE;
    }
    if args.seconds > 0.0 && args.rate <= 0.0 {
        eprintln!("Sampling rate must be positive.");
        return ExitCode::FAILURE;
    }

    match run(args.pid as Pid, args.rate, args.seconds) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(pid: Pid, rate: f64, seconds: f64) -> Result<(), Error> {
    let mut tracee = TracedProcess::attach(pid)?;
    let addr = thread_state_addr(&tracee)?;

    if seconds == 0.0 {
        sample(&tracee, addr);
        return tracee.detach().map_err(Into::into);
    }

    let interval = Duration::from_secs_f64(rate);
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    loop {
        let started = Instant::now();
        sample(&tracee, addr);
        if Instant::now() + interval >= deadline {
            break;
        }
        // Let the target run between samples. Subtracting the time the
        // sample took keeps the effective period at the configured rate.
        tracee.detach()?;
        std::thread::sleep(interval.saturating_sub(started.elapsed()));
        println!();
        tracee = TracedProcess::attach(pid)?;
    }
    tracee.detach()?;
    Ok(())
}

/// Takes one sample and prints it, most recent frame first. A failed walk
/// costs only this sample and is reported to stderr.
fn sample(tracee: &TracedProcess, addr: usize) {
    match get_stack(tracee, addr) {
        Ok(stack) => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for frame in stack.iter().rev() {
                let _ = writeln!(out, "{frame}");
            }
            let _ = out.flush();
        }
        Err(err) => eprintln!("{err}"),
    }
}
