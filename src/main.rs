//! sshfleet - Main entry point.
//!
//! Usage: sshfleet <COMMAND> [ARGS] [OPTIONS]
//!
//! Commands:
//!   hosts                       List saved hosts
//!   groups                      List host groups
//!   add <address> <login>       Save a host (secret from SSHFLEET_HOST_SECRET or prompt)
//!   remove <label>              Delete a host
//!   edit <label> <field=value>...  Change saved host fields
//!   search <query>              Find hosts by label, address or description
//!   exec <command>              Run a command on the selected hosts
//!   upload <local> <remote>     Upload a file, directory or pattern
//!   download <remote> <local>   Download a file from one host
//!
//! Options:
//!   --group <name>              Select hosts in a group
//!   --host <label>              Select a host by label (repeatable)
//!   --port, --label, --description   Fields for `add`
//!   --version, -v               Show version (first argument only)
//!   --                          End of options
//!
//! Options after the first word of an `exec` command belong to that
//! command. The master secret is read from SSHFLEET_MASTER_SECRET or
//! prompted for without echo.

use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use sshfleet::config::Config;
use sshfleet::fanout::{Broadcaster, OperationResult, Payload};
use sshfleet::logging;
use sshfleet::prompt::read_secret;
use sshfleet::registry::{HostChange, HostRecord, HostRegistry};
use sshfleet::session::SshTransport;
use sshfleet::transfer::{TransferOrchestrator, TransferProgress, format_size, format_speed};
use zeroize::Zeroizing;

/// Environment variable holding the master secret.
const MASTER_SECRET_ENV: &str = "SSHFLEET_MASTER_SECRET";

/// Environment variable holding a new host's secret for `add`.
const HOST_SECRET_ENV: &str = "SSHFLEET_HOST_SECRET";

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Parsed command line.
#[derive(Debug, Default)]
struct Args {
    command: Option<String>,
    positionals: Vec<String>,
    group: Option<String>,
    hosts: Vec<String>,
    port: Option<u16>,
    label: Option<String>,
    description: Option<String>,
}

impl Args {
    fn parse(raw: impl IntoIterator<Item = String>) -> CliResult<Self> {
        let mut args = Self::default();
        let mut raw = raw.into_iter();
        let mut options_done = false;

        while let Some(arg) = raw.next() {
            if options_done {
                args.positionals.push(arg);
                continue;
            }
            if arg == "--" {
                options_done = true;
                continue;
            }

            let mut value = |flag: &str| {
                raw.next()
                    .ok_or_else(|| format!("{} needs a value", flag))
            };
            match arg.as_str() {
                "--group" | "-g" => args.group = Some(value(&arg)?),
                "--host" | "-H" => args.hosts.push(value(&arg)?),
                "--port" | "-p" => {
                    let port = value(&arg)?;
                    args.port = Some(
                        port.parse()
                            .map_err(|_| format!("invalid port '{}'", port))?,
                    );
                }
                "--label" | "-l" => args.label = Some(value(&arg)?),
                "--description" | "-d" => args.description = Some(value(&arg)?),
                _ if args.command.is_none() => args.command = Some(arg),
                _ => {
                    // The rest of an exec line is the remote command verbatim.
                    if args.command.as_deref() == Some("exec") {
                        options_done = true;
                    }
                    args.positionals.push(arg);
                }
            }
        }

        Ok(args)
    }

    fn positional(&self, index: usize, name: &str) -> CliResult<&str> {
        self.positionals
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| format!("missing <{}>", name).into())
    }
}

fn main() -> ExitCode {
    let raw: Vec<String> = env::args().skip(1).collect();

    match raw.first().map(String::as_str) {
        Some("--version" | "-v") => {
            println!("sshfleet v{}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        None | Some("--help" | "-h" | "help") => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Some(_) => {}
    }

    match run(raw) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Runs one command. `Ok(false)` means it ran but some host failed.
fn run(raw: Vec<String>) -> CliResult<bool> {
    let args = Args::parse(raw)?;
    let config = Config::load()?;

    if let Err(e) = logging::init(&config.log_config, &config.data_dir) {
        eprintln!("warning: logging disabled: {}", e);
    }

    let first_run = HostRegistry::is_first_run(&config.data_dir);
    if first_run {
        println!(
            "No host registry at {}; a new one will be created.",
            config.data_dir.display()
        );
    }
    let secret = master_secret(first_run)?;
    let registry = HostRegistry::open_or_create(&config.data_dir, &secret)?;
    drop(secret);

    let transport = Arc::new(SshTransport::new());

    match args.command.as_deref().unwrap_or_default() {
        "hosts" | "list" => {
            let hosts = registry.list(args.group.as_deref());
            if hosts.is_empty() {
                println!("No saved hosts.");
            }
            for host in hosts {
                println!("{}  [{}]  {}", host.display(), host.group, host.description);
            }
            Ok(true)
        }
        "groups" => {
            for group in registry.groups() {
                let count = registry.list(Some(group.as_str())).len();
                println!("{} ({})", group, count);
            }
            Ok(true)
        }
        "add" => {
            let address = args.positional(0, "address")?;
            let login = args.positional(1, "login")?;
            let host_secret = match env::var(HOST_SECRET_ENV) {
                Ok(s) => Zeroizing::new(s),
                Err(_) => read_secret(&format!("Password for {}@{}: ", login, address))?,
            };

            let record = new_record(&args, address, login, &host_secret)?;
            let shown = record.display();
            let id = registry.add(record)?;
            println!("Saved {} ({})", shown, id.short());
            Ok(true)
        }
        "remove" | "rm" => {
            let label = args.positional(0, "label")?;
            let host = find_host(&registry, label)?;
            registry.remove(host.id())?;
            println!("Removed {}", host.display());
            Ok(true)
        }
        "edit" => {
            let label = args.positional(0, "label")?;
            let host = edit_host(&registry, label, &args.positionals[1..])?;
            println!("Updated {}", host.display());
            Ok(true)
        }
        "search" | "find" => {
            let hosts = search_hosts(&registry, &args.positionals.join(" "))?;
            if hosts.is_empty() {
                println!("No matching hosts.");
            }
            for host in hosts {
                println!("{}  [{}]  {}", host.display(), host.group, host.description);
            }
            Ok(true)
        }
        "exec" => {
            let command = args.positionals.join(" ");
            if command.is_empty() {
                return Err("missing <command>".into());
            }
            let hosts = select_hosts(&registry, &args)?;
            let broadcaster = Broadcaster::new(transport)
                .with_engine(config.engine())
                .with_connect_timeout(config.connect_timeout)
                .with_command_timeout(config.command_timeout);

            let results = broadcaster.run(&hosts, &command, Some(&print_result));
            Ok(summarize(&results))
        }
        "upload" | "put" => {
            let local = args.positional(0, "local")?;
            let remote = args.positional(1, "remote")?;
            let hosts = select_hosts(&registry, &args)?;
            let orchestrator = orchestrator(transport, &config);

            let results =
                orchestrator.broadcast_upload(&hosts, local, remote, None, Some(&print_result));
            Ok(summarize(&results))
        }
        "download" | "get" => {
            let remote = args.positional(0, "remote")?;
            let local = args.positional(1, "local")?;
            let hosts = select_hosts(&registry, &args)?;
            let [host] = hosts.as_slice() else {
                return Err("download needs exactly one host (use --host <label>)".into());
            };
            let orchestrator = orchestrator(transport, &config);

            let result =
                orchestrator.download_from(host, remote, Path::new(local), Some(&print_progress));
            eprintln!();
            print_result(&result);
            Ok(result.success())
        }
        other => Err(format!("unknown command '{}' (try --help)", other).into()),
    }
}

fn orchestrator(transport: Arc<SshTransport>, config: &Config) -> TransferOrchestrator {
    TransferOrchestrator::new(transport)
        .with_engine(config.engine())
        .with_connect_timeout(config.connect_timeout)
        .with_progress_interval(config.progress_interval)
}

/// Builds a new host from `add` arguments, rejecting values the record
/// cannot hold.
fn new_record(args: &Args, address: &str, login: &str, secret: &str) -> CliResult<HostRecord> {
    HostChange::Address(address.to_string()).validate()?;
    let mut record = HostRecord::new(address.trim(), login, secret);
    if let Some(port) = args.port {
        HostChange::Port(port).validate()?;
        record = record.with_port(port);
    }
    if let Some(label) = &args.label {
        record = record.with_label(label.as_str());
    }
    if let Some(group) = &args.group {
        record = record.with_group(group.as_str());
    }
    if let Some(description) = &args.description {
        record = record.with_description(description.as_str());
    }
    Ok(record)
}

fn find_host(registry: &HostRegistry, label: &str) -> CliResult<HostRecord> {
    registry
        .find_by_label(label)
        .ok_or_else(|| format!("no host labelled {}", label).into())
}

/// Applies `field=value` assignments to the host labelled `label`.
fn edit_host(registry: &HostRegistry, label: &str, assignments: &[String]) -> CliResult<HostRecord> {
    let host = find_host(registry, label)?;
    if assignments.is_empty() {
        return Err("missing <field=value>".into());
    }

    let changes = assignments
        .iter()
        .map(|assignment| -> CliResult<HostChange> {
            let (field, value) = assignment
                .split_once('=')
                .ok_or_else(|| format!("expected field=value, got '{}'", assignment))?;
            Ok(HostChange::parse(field, value)?)
        })
        .collect::<CliResult<Vec<_>>>()?;

    registry.update(host.id(), &changes)?;
    registry
        .get(host.id())
        .ok_or_else(|| format!("host {} was removed concurrently", label).into())
}

fn search_hosts(registry: &HostRegistry, query: &str) -> CliResult<Vec<HostRecord>> {
    let query = query.trim();
    if query.is_empty() {
        return Err("missing <query>".into());
    }
    Ok(registry.search(query))
}

/// Hosts named by `--host`, else those in `--group`, else all.
fn select_hosts(registry: &HostRegistry, args: &Args) -> CliResult<Vec<HostRecord>> {
    let hosts = if args.hosts.is_empty() {
        registry.list(args.group.as_deref())
    } else {
        args.hosts
            .iter()
            .map(|label| find_host(registry, label))
            .collect::<CliResult<Vec<_>>>()?
    };

    if hosts.is_empty() {
        return Err("no hosts selected".into());
    }
    Ok(hosts)
}

fn master_secret(first_run: bool) -> CliResult<Zeroizing<String>> {
    if let Ok(secret) = env::var(MASTER_SECRET_ENV) {
        return Ok(Zeroizing::new(secret));
    }
    let secret = read_secret("Master password: ")?;
    if first_run && *read_secret("Confirm master password: ")? != *secret {
        return Err("passwords do not match".into());
    }
    Ok(secret)
}

fn print_result(result: &OperationResult) {
    let status = if result.success() { "ok" } else { "FAILED" };
    println!(
        "== {} [{}] {} ({:.1}s)",
        result.host(),
        status,
        result.request(),
        result.elapsed().as_secs_f64()
    );

    match result.payload() {
        Payload::Command(output) => {
            print!("{}", output.stdout);
            if !output.stderr.is_empty() {
                eprint!("{}", output.stderr);
            }
            if output.exit_code != 0 {
                println!("(exit {})", output.exit_code);
            }
        }
        Payload::Transfer(stats) => {
            println!(
                "{} at {}",
                format_size(stats.bytes),
                format_speed(stats.bytes_per_sec())
            );
        }
        Payload::None => {}
    }
    if let Some(message) = result.error_message() {
        println!("{}", message);
    }
}

fn print_progress(progress: &TransferProgress) {
    eprint!(
        "\r{} {:5.1}% {} / {} {}",
        progress.file,
        progress.percentage(),
        format_size(progress.transferred),
        format_size(progress.total),
        format_speed(progress.bytes_per_sec)
    );
}

/// Prints the success count; returns true if every result succeeded.
fn summarize(results: &[OperationResult]) -> bool {
    let ok = results.iter().filter(|r| r.success()).count();
    println!("{} of {} succeeded", ok, results.len());
    ok == results.len()
}

fn print_usage() {
    println!(
        "sshfleet v{}\n\n\
         Usage: sshfleet <COMMAND> [ARGS] [OPTIONS]\n\n\
         Commands:\n  \
           hosts                      List saved hosts\n  \
           groups                     List host groups\n  \
           add <address> <login>      Save a host\n  \
           remove <label>             Delete a host\n  \
           edit <label> <field=value>...  Change host fields\n  \
           search <query>             Find hosts\n  \
           exec <command>             Run a command on the selected hosts\n  \
           upload <local> <remote>    Upload a file, directory or pattern\n  \
           download <remote> <local>  Download a file from one host\n\n\
         Options:\n  \
           --group <name>             Select hosts in a group\n  \
           --host <label>             Select a host by label (repeatable)\n  \
           --port <n> --label <l> --description <d>   Fields for add\n  \
           --                         End of options\n\n\
         Environment:\n  \
           {}   Master password\n  \
           {}     Host password for add",
        env!("CARGO_PKG_VERSION"),
        MASTER_SECRET_ENV,
        HOST_SECRET_ENV
    );
}
