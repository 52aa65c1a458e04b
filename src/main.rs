use std::io::IsTerminal;
use std::time::Duration;

use clap::Parser;
use console::style;
use indicatif::ProgressBar;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vguest::cli::{Cli, Command, DEFAULT_COMMAND, process_exit_code};
use vguest::config::Settings;
use vguest::error::VguestError;
use vguest::executor::GuestCommandExecutor;
use vguest::reader::GuestFileReader;
use vguest::session::Session;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let use_spinner = std::io::stderr().is_terminal() && !cli.verbose && !cli.json;

    // Tracing output corrupts indicatif's line tracking; keep it to warnings
    // while the spinner owns the terminal.
    let filter = if cli.verbose {
        EnvFilter::new("vguest=debug")
    } else if use_spinner {
        EnvFilter::new("vguest=warn")
    } else {
        EnvFilter::from_default_env()
            .add_directive("vguest=info".parse().expect("valid log directive"))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();

    let mut settings = Settings::load(&cli.env_file)?;
    if cli.insecure {
        settings.connection.verify_ssl = false;
    }

    match cli.command {
        Command::Exec {
            vm,
            timeout,
            command,
        } => {
            let vm = resolve_vm(vm)?;
            let command = resolve_command(command)?;
            let ui = Ui {
                json: cli.json,
                spinner: use_spinner,
            };
            let timeout = Duration::from_secs(timeout);
            let code = run_exec(&settings, &vm, &command, timeout, &ui).await?;
            if code != 0 {
                std::process::exit(process_exit_code(code));
            }
        }
        Command::Cat {
            vm,
            max_lines,
            path,
        } => {
            let vm = resolve_vm(Some(vm))?;
            let ui = Ui {
                json: cli.json,
                spinner: use_spinner,
            };
            run_cat(&settings, &vm, &path, max_lines, &ui).await?;
        }
    }

    Ok(())
}

struct Ui {
    json: bool,
    spinner: bool,
}

impl Ui {
    fn status(&self, text: &str) {
        if !self.json {
            println!("{} {text}", style("\u{2192}").cyan());
        }
    }

    fn spinner(&self, message: String) -> Option<ProgressBar> {
        if !self.spinner {
            return None;
        }
        let s = ProgressBar::new_spinner();
        s.set_message(message);
        s.enable_steady_tick(Duration::from_millis(80));
        Some(s)
    }
}

/// Returns the guest exit code, 0 when the guest did not report one.
async fn run_exec(
    settings: &Settings,
    vm: &str,
    command: &str,
    timeout: Duration,
    ui: &Ui,
) -> Result<i32, VguestError> {
    ui.status(&format!("Connecting to {}", settings.connection.host));
    let mut session = Session::connect(&settings.connection).await?;
    ui.status(&format!("Connected ({})", session.product()));

    let spinner = ui.spinner(format!("Running `{command}` on {vm}..."));
    let result = GuestCommandExecutor::new(&session, &settings.guest)
        .run(vm, command, timeout)
        .await;
    if let Some(s) = spinner {
        s.finish_and_clear();
    }

    session.disconnect().await;
    let result = result?;

    if ui.json {
        let json = facet_json::to_string(&ExecJson {
            vm: vm.to_string(),
            command: command.to_string(),
            stdout: result.stdout,
            exit_code: result.exit_code,
        })
        .map_err(json_err)?;
        println!("{json}");
    } else {
        println!(
            "{}",
            style(format!("== output of `{command}` on {vm} ==")).bold()
        );
        print!("{}", result.stdout);
        if !result.stdout.is_empty() && !result.stdout.ends_with('\n') {
            println!();
        }
        match result.exit_code {
            Some(0) => println!("{}", style("exit code 0").green()),
            Some(code) => println!("{}", style(format!("exit code {code}")).red()),
            None => println!("{}", style("exit code unknown").yellow()),
        }
    }

    Ok(result.exit_code.unwrap_or(0))
}

async fn run_cat(
    settings: &Settings,
    vm: &str,
    path: &str,
    max_lines: usize,
    ui: &Ui,
) -> Result<(), VguestError> {
    ui.status(&format!("Connecting to {}", settings.connection.host));
    let mut session = Session::connect(&settings.connection).await?;

    let spinner = ui.spinner(format!("Reading {path} from {vm}..."));
    let content = GuestFileReader::new(&session, &settings.guest)
        .read_file(vm, path, max_lines)
        .await;
    if let Some(s) = spinner {
        s.finish_and_clear();
    }

    session.disconnect().await;
    let content = content?;

    if ui.json {
        let json = facet_json::to_string(&CatJson {
            vm: vm.to_string(),
            path: path.to_string(),
            content,
        })
        .map_err(json_err)?;
        println!("{json}");
    } else {
        println!("{}", style(format!("== {path} on {vm} ==")).bold());
        print!("{content}");
        if !content.is_empty() && !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn resolve_vm(vm: Option<String>) -> Result<String, VguestError> {
    let name = match vm {
        Some(name) => name,
        None if std::io::stdin().is_terminal() => inquire::Text::new("VM name:")
            .prompt()
            .map_err(map_inquire_err)?,
        None => {
            return Err(VguestError::Config {
                message: "no VM name given; pass --vm".into(),
            });
        }
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(VguestError::Config {
            message: "VM name must not be empty".into(),
        });
    }
    Ok(name.to_string())
}

fn resolve_command(parts: Vec<String>) -> Result<String, VguestError> {
    let command = if !parts.is_empty() {
        parts.join(" ")
    } else if std::io::stdin().is_terminal() {
        inquire::Text::new("Command:")
            .with_placeholder(DEFAULT_COMMAND)
            .prompt()
            .map_err(map_inquire_err)?
    } else {
        String::new()
    };
    let command = command.trim();
    if command.is_empty() {
        Ok(DEFAULT_COMMAND.to_string())
    } else {
        Ok(command.to_string())
    }
}

fn map_inquire_err(e: inquire::InquireError) -> VguestError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            VguestError::PromptCancelled
        }
        other => VguestError::Prompt {
            message: other.to_string(),
        },
    }
}

fn json_err(e: impl std::fmt::Display) -> VguestError {
    VguestError::Execution {
        message: format!("JSON serialization failed: {e}"),
    }
}

// ── JSON output structs ─────────────────────────────────────────────

#[derive(facet::Facet)]
struct ExecJson {
    vm: String,
    command: String,
    stdout: String,
    exit_code: Option<i32>,
}

#[derive(facet::Facet)]
struct CatJson {
    vm: String,
    path: String,
    content: String,
}
