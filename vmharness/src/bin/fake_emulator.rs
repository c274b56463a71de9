//! Stand-in emulator for integration tests.
//!
//! Understands just enough of the emulator command line to find its monitor
//! (`-chardev socket,id=mon,...` or `-qmp unix:PATH|tcp:HOST:PORT`) and the
//! automatic console, then speaks the monitor protocol:
//!
//! | command            | behaviour                                  |
//! |--------------------|--------------------------------------------|
//! | `qmp_capabilities` | leaves negotiation mode                    |
//! | `query-target`     | `{"arch": $FAKE_EMULATOR_ARCH or x86_64}`  |
//! | `query-status`     | `running`, `paused`, `prelaunch` (`-S`) or `inmigrate` |
//! | `stop` / `cont`    | emits `STOP` / `RESUME`, then replies      |
//! | `quit`             | replies and exits 0                        |
//! | `human-monitor-command` | `migrate -d tcp:H:P`, `info migrate`  |
//!
//! With `-incoming tcp:0:PORT` it listens on PORT and reports `inmigrate`.
//! `migrate` connects to the destination's port; the migration completes
//! after one `active` poll, or fails if the port is unreachable.
//!
//! Fault injection: `-fake-exit-early` exits with status 1 before touching
//! the monitor; `-fake-crash-on-quit` dies from SIGKILL after replying to
//! `quit`; `-fake-migration-fails` and `-fake-migration-stalls` make
//! migrations fail or never finish.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::signal::{Signal, raise};
use serde_json::{Value, json};

const ARCH_ENV: &str = "FAKE_EMULATOR_ARCH";

#[derive(Debug, Default)]
struct Config {
    monitor: Option<MonitorAddr>,
    console: Option<String>,
    incoming: Option<u16>,
    start_paused: bool,
    exit_early: bool,
    crash_on_quit: bool,
    migration_fails: bool,
    migration_stalls: bool,
}

#[derive(Debug, Clone, Copy)]
enum Migration {
    Active { polls_left: u32 },
    Completed,
    Failed,
    Stalled,
}

impl Migration {
    /// Status for one `info migrate` poll, advancing the state.
    fn poll(&mut self) -> &'static str {
        match *self {
            Migration::Active { polls_left: 0 } => {
                *self = Migration::Completed;
                "active"
            }
            Migration::Active { polls_left } => {
                *self = Migration::Active {
                    polls_left: polls_left - 1,
                };
                "active"
            }
            Migration::Completed => "completed",
            Migration::Failed => "failed",
            Migration::Stalled => "active",
        }
    }
}

#[derive(Debug)]
enum MonitorAddr {
    Unix(String),
    Tcp(String, u16),
}

trait Stream: io::Read + io::Write {}
impl<T: io::Read + io::Write> Stream for T {}

fn parse_args(args: &[String]) -> Config {
    let mut config = Config::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-chardev" => {
                if let Some(spec) = iter.next() {
                    parse_chardev(spec, &mut config);
                }
            }
            "-qmp" => config.monitor = iter.next().and_then(|uri| parse_uri(uri)),
            "-incoming" => {
                config.incoming = iter
                    .next()
                    .and_then(|uri| uri.rsplit_once(':'))
                    .and_then(|(_, port)| port.parse().ok())
            }
            "-S" => config.start_paused = true,
            "-fake-exit-early" => config.exit_early = true,
            "-fake-crash-on-quit" => config.crash_on_quit = true,
            "-fake-migration-fails" => config.migration_fails = true,
            "-fake-migration-stalls" => config.migration_stalls = true,
            _ => {}
        }
    }
    config
}

fn parse_chardev(spec: &str, config: &mut Config) {
    let option = |key: &str| {
        spec.split(',')
            .find_map(|kv| kv.strip_prefix(key).and_then(|v| v.strip_prefix('=')))
            .map(str::to_string)
    };
    match option("id").as_deref() {
        Some("mon") => {
            config.monitor = match (option("path"), option("host"), option("port")) {
                (Some(path), _, _) => Some(MonitorAddr::Unix(path)),
                (None, Some(host), Some(port)) => {
                    port.parse().ok().map(|port| MonitorAddr::Tcp(host, port))
                }
                _ => None,
            }
        }
        Some("console") => config.console = option("path"),
        _ => {}
    }
}

fn parse_uri(uri: &str) -> Option<MonitorAddr> {
    if let Some(path) = uri.strip_prefix("unix:") {
        return Some(MonitorAddr::Unix(path.split(',').next()?.to_string()));
    }
    let rest = uri.strip_prefix("tcp:")?;
    let (host, port) = rest.split(',').next()?.rsplit_once(':')?;
    Some(MonitorAddr::Tcp(host.to_string(), port.parse().ok()?))
}

fn connect(addr: &MonitorAddr) -> io::Result<(Box<dyn BufRead>, Box<dyn Stream>)> {
    match addr {
        MonitorAddr::Unix(path) => {
            let stream = UnixStream::connect(path)?;
            Ok((Box::new(BufReader::new(stream.try_clone()?)), Box::new(stream)))
        }
        MonitorAddr::Tcp(host, port) => {
            let stream = TcpStream::connect((host.as_str(), *port))?;
            Ok((Box::new(BufReader::new(stream.try_clone()?)), Box::new(stream)))
        }
    }
}

/// Serve console clients a one-line banner from a background thread.
fn serve_console(path: &str) -> io::Result<()> {
    let listener = UnixListener::bind(path)?;
    std::thread::spawn(move || {
        for mut client in listener.incoming().flatten() {
            let _ = client.write_all(b"fake-emulator console ready\n");
        }
    });
    Ok(())
}

/// Accept and drop migration streams on `port`.
fn serve_incoming(port: u16) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    std::thread::spawn(move || for _stream in listener.incoming().flatten() {});
    Ok(())
}

fn start_migration(target: &str, config: &Config) -> Migration {
    if config.migration_fails {
        return Migration::Failed;
    }
    if config.migration_stalls {
        return Migration::Stalled;
    }
    let reachable = target
        .strip_prefix("tcp:")
        .and_then(|rest| rest.rsplit_once(':'))
        .and_then(|(host, port)| {
            let host = if host == "0" { "127.0.0.1" } else { host };
            Some((host.to_string(), port.parse::<u16>().ok()?))
        })
        .is_some_and(|(host, port)| TcpStream::connect((host.as_str(), port)).is_ok());
    if reachable {
        Migration::Active { polls_left: 0 }
    } else {
        Migration::Failed
    }
}

fn send(out: &mut dyn Stream, value: &Value) -> io::Result<()> {
    out.write_all(value.to_string().as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()
}

fn event(name: &str) -> Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    json!({
        "event": name,
        "timestamp": {"seconds": now.as_secs(), "microseconds": now.subsec_micros()},
    })
}

fn error(class: &str, desc: &str) -> Value {
    json!({"error": {"class": class, "desc": desc}})
}

fn run(config: Config) -> io::Result<ExitCode> {
    if config.exit_early {
        eprintln!("fake-emulator: exiting before connecting to the monitor");
        return Ok(ExitCode::from(1));
    }
    if let Some(path) = &config.console {
        serve_console(path)?;
    }
    if let Some(port) = config.incoming {
        serve_incoming(port)?;
    }

    let addr = config
        .monitor
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no monitor configured"))?;
    let (mut input, mut out) = connect(addr)?;
    eprintln!("fake-emulator: connected to monitor {:?}", addr);

    send(
        out.as_mut(),
        &json!({"QMP": {
            "version": {"qemu": {"major": 8, "minor": 2, "micro": 0}, "package": "fake"},
            "capabilities": [],
        }}),
    )?;

    let arch = std::env::var(ARCH_ENV).unwrap_or_else(|_| "x86_64".to_string());
    let mut status = match (config.incoming, config.start_paused) {
        (Some(_), _) => "inmigrate",
        (None, true) => "prelaunch",
        (None, false) => "running",
    };
    let mut migration: Option<Migration> = None;
    let mut negotiated = false;
    let mut line = String::new();

    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            eprintln!("fake-emulator: monitor hung up");
            return Ok(ExitCode::SUCCESS);
        }
        let Ok(command) = serde_json::from_str::<Value>(line.trim()) else {
            send(out.as_mut(), &error("GenericError", "JSON parse error"))?;
            continue;
        };
        let name = command["execute"].as_str().unwrap_or_default();
        eprintln!("fake-emulator: {}", name);

        if !negotiated && name != "qmp_capabilities" {
            send(
                out.as_mut(),
                &error(
                    "CommandNotFound",
                    "Expecting capabilities negotiation with 'qmp_capabilities'",
                ),
            )?;
            continue;
        }

        let reply = match name {
            "qmp_capabilities" => {
                negotiated = true;
                json!({"return": {}})
            }
            "query-target" => json!({"return": {"arch": arch}}),
            "query-status" => {
                json!({"return": {"status": status, "running": status == "running", "singlestep": false}})
            }
            "stop" => {
                status = "paused";
                send(out.as_mut(), &event("STOP"))?;
                json!({"return": {}})
            }
            "cont" => {
                status = "running";
                send(out.as_mut(), &event("RESUME"))?;
                json!({"return": {}})
            }
            "human-monitor-command" => {
                let line = command["arguments"]["command-line"]
                    .as_str()
                    .unwrap_or_default();
                let output = if let Some(target) = line.strip_prefix("migrate -d ") {
                    migration = Some(start_migration(target.trim(), &config));
                    String::new()
                } else if line == "info migrate" {
                    migration
                        .as_mut()
                        .map(|m| format!("Migration status: {}\n", m.poll()))
                        .unwrap_or_default()
                } else {
                    format!("unknown command: '{}'\n", line)
                };
                json!({"return": output})
            }
            "quit" => {
                send(out.as_mut(), &json!({"return": {}}))?;
                if config.crash_on_quit {
                    eprintln!("fake-emulator: crashing on quit");
                    raise(Signal::SIGKILL).map_err(io::Error::from)?;
                }
                eprintln!("fake-emulator: quitting");
                return Ok(ExitCode::SUCCESS);
            }
            other => error(
                "CommandNotFound",
                &format!("The command {} has not been found", other),
            ),
        };
        send(out.as_mut(), &reply)?;
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    eprintln!("fake-emulator: started with {}", args.join(" "));
    match run(parse_args(&args)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fake-emulator: {}", e);
            ExitCode::from(2)
        }
    }
}
