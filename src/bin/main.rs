use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

use replbridge::config::{self, SettingsEventKind};
use replbridge::introspect::{self, Category};
use replbridge::{
    Bridge, BridgeError, BridgeHost, BridgeOptions, LaunchSpec, PromptMatcher, Reply,
    ResponseTimeout, ShutdownGrace,
};

/// Drive interactive REPLs (python, sh, node, ...) from a tabbed console
#[derive(Parser)]
#[command(name = "replbridge")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive console on a REPL (the default)
    Run(RunArgs),
    /// Print a system listing: processes, threads or sockets
    List {
        category: Category,
    },
    /// Print the configured REPL profiles
    Profiles {
        /// Extra config file layered on top of user and project config
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Profile to launch (default: defaultProfile from config, else python)
    #[arg(long, short)]
    profile: Option<String>,

    /// Extra config file layered on top of user and project config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Prompt regex, overriding the profile's
    #[arg(long)]
    prompt: Option<String>,

    /// Response timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Grace period before a REPL is killed on shutdown, in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Command to run instead of the profile's, e.g. `-- python3 -i`
    #[arg(last = true)]
    command: Vec<String>,
}

const HELP: &str = "\
Console commands:
  :fork            start another tab running the same command
  :tabs            list tabs
  :switch NAME     make NAME the active tab
  :close           close the active tab
  :list CATEGORY   list processes, threads or sockets
  :help            show this help
Anything else is sent to the active REPL.";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::List { category }) => match introspect::list(category).await {
            Ok(entries) => {
                for entry in entries {
                    println!("{}", entry);
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Some(Commands::Profiles { config }) => {
            let settings = load_settings(config.as_deref());
            for name in settings.profile_names() {
                match settings.resolve_profile(Some(name)) {
                    Ok(spec) => println!("{:<12} {}", name, spec.command_line()),
                    Err(e) => println!("{:<12} (invalid: {})", name, e),
                }
            }
        }
        Some(Commands::Run(args)) => run(args).await,
        None => run(cli.run).await,
    }
}

fn load_settings(explicit: Option<&std::path::Path>) -> config::BridgeSettings {
    let project_root = std::env::current_dir().ok();
    let outcome = config::load_settings(project_root.as_deref(), explicit);
    for event in outcome.events {
        match event.kind {
            SettingsEventKind::Info => log::info!(target: "replbridge::config", "{}", event.message),
            SettingsEventKind::Warning => {
                log::warn!(target: "replbridge::config", "{}", event.message)
            }
        }
    }
    outcome.settings
}

fn resolve(args: &RunArgs) -> Result<(LaunchSpec, BridgeOptions), BridgeError> {
    let settings = load_settings(args.config.as_deref());
    let mut options = settings.bridge_options()?;
    if let Some(ms) = args.timeout_ms {
        options.timeouts.response = ResponseTimeout::from_millis(ms)?;
    }
    if let Some(ms) = args.grace_ms {
        options.timeouts.grace = ShutdownGrace::from_millis(ms)?;
    }

    let profile = settings.resolve_profile(args.profile.as_deref())?;
    let prompt = match &args.prompt {
        Some(pattern) => PromptMatcher::new(pattern)?
            .with_normalization(profile.prompt().normalization())
            .with_partial_lines(profile.prompt().matches_partial_lines()),
        None => profile.prompt().clone(),
    };
    let spec = match args.command.split_first() {
        Some((command, rest)) => LaunchSpec::new(command.as_str(), rest.iter().cloned(), prompt)
            .with_merge_stderr(profile.merges_stderr()),
        None => LaunchSpec::new(profile.command(), profile.args().iter().cloned(), prompt)
            .with_merge_stderr(profile.merges_stderr()),
    };
    Ok((spec, options))
}

async fn run(args: RunArgs) {
    let (spec, options) = match resolve(&args) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let console = Console {
        host: BridgeHost::new(options),
        active: Arc::new(Mutex::new(String::new())),
    };
    if let Err(e) = console.open(spec).await {
        eprintln!("Error: {}", e);
        console.host.shutdown_all().await;
        std::process::exit(1);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        };

        let keep_going = tokio::select! {
            keep_going = console.handle(&line) => keep_going,
            _ = tokio::signal::ctrl_c() => false,
        };
        if !keep_going {
            break;
        }
    }

    console.host.shutdown_all().await;
}

struct Console {
    host: BridgeHost,
    active: Arc<Mutex<String>>,
}

impl Console {
    fn active(&self) -> String {
        self.active
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    fn set_active(&self, identity: &str) {
        if let Ok(mut active) = self.active.lock() {
            *active = identity.to_string();
        }
    }

    /// Start `spec` in a new tab and make it active.
    async fn open(&self, spec: LaunchSpec) -> Result<(), BridgeError> {
        let bridge = self.host.create(spec);
        self.attach(&bridge);
        self.start(&bridge).await
    }

    async fn start(&self, bridge: &Bridge) -> Result<(), BridgeError> {
        self.set_active(bridge.identity());
        eprintln!(
            "Starting {}: {}",
            bridge.identity(),
            bridge.launch_spec().command_line()
        );
        bridge.start()?;
        eprintln!("Waiting for REPL to initialize...");
        // The first prompt is announced by on_ready; give up waiting for it after the response timeout
        let limit = bridge.timeouts().response.as_duration();
        if let Err(e) = bridge.wait_ready(limit).await {
            eprintln!("{}: {} ({})", bridge.identity(), e, e.retry_hint());
        }
        Ok(())
    }

    fn attach(&self, bridge: &Bridge) {
        let identity = bridge.identity().to_string();

        let active = Arc::clone(&self.active);
        let id = identity.clone();
        bridge.on_output_line(move |line| {
            let is_active = active.lock().map(|a| *a == id).unwrap_or(false);
            let mut out = std::io::stdout().lock();
            let _ = match (is_active, line.is_prompt) {
                (true, true) => write!(out, "{}", line.text),
                (true, false) => writeln!(out, "{}", line.text),
                (false, true) => Ok(()),
                (false, false) => writeln!(out, "[{}] {}", id, line.text),
            };
            let _ = out.flush();
        });

        let id = identity.clone();
        bridge.on_ready(move || eprintln!("{} ready for input!", id));

        bridge.on_late_response(|late| {
            eprintln!(
                "(late output from command #{}: {} line(s))",
                late.seq,
                late.lines.len()
            );
        });

        bridge.on_clear_screen(|| {
            let mut out = std::io::stdout().lock();
            let _ = write!(out, "\x1b[2J\x1b[H");
            let _ = out.flush();
        });

        bridge.on_terminated(|termination| eprintln!("{}", termination));
    }

    /// Handle one input line. Returns false when the console should exit.
    async fn handle(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if let Some(command) = trimmed.strip_prefix(':') {
            return self.handle_console_command(command).await;
        }

        let Some(bridge) = self.host.get(&self.active()) else {
            eprintln!("No active REPL. Use :tabs and :switch.");
            return true;
        };
        match bridge.submit(line).await {
            Ok(Reply::Output(response)) => {
                if let Some(seq) = response.late_output_from {
                    eprintln!(
                        "(output may include late output from command #{})",
                        seq
                    );
                }
                if response.dropped_lines > 0 {
                    eprintln!("({} line(s) dropped)", response.dropped_lines);
                }
                true
            }
            Ok(Reply::ClearScreen) => true,
            Ok(Reply::Exited) => {
                let identity = bridge.identity().to_string();
                self.host.close(&identity).await;
                self.switch_to_first()
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("{}", e.retry_hint());
                true
            }
        }
    }

    async fn handle_console_command(&self, command: &str) -> bool {
        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };
        match name {
            "fork" => {
                let forked = match self.host.fork(&self.active()) {
                    Ok(forked) => forked,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        return true;
                    }
                };
                self.attach(&forked);
                if let Err(e) = self.start(&forked).await {
                    eprintln!("Error: {}", e);
                }
            }
            "tabs" => {
                let active = self.active();
                for summary in self.host.summaries() {
                    let marker = if summary.identity == active { "*" } else { " " };
                    let liveness = if summary.alive { "alive" } else { "dead" };
                    println!(
                        "{} {} {} ({})",
                        marker, summary.identity, summary.state, liveness
                    );
                }
            }
            "switch" => {
                if self.host.get(argument).is_some() {
                    self.set_active(argument);
                } else {
                    eprintln!("No tab named '{}'", argument);
                }
            }
            "close" => {
                let active = self.active();
                self.host.close(&active).await;
                return self.switch_to_first();
            }
            "list" => match argument.parse::<Category>() {
                Ok(category) => match introspect::list(category).await {
                    Ok(entries) => entries.iter().for_each(|entry| println!("{}", entry)),
                    Err(e) => eprintln!("Error: {}", e),
                },
                Err(e) => eprintln!("Error: {}", e),
            },
            "help" => println!("{}", HELP),
            other => eprintln!("Unknown command ':{}'. Try :help", other),
        }
        true
    }

    /// After a tab closed. Returns false when no tab is left.
    fn switch_to_first(&self) -> bool {
        match self.host.identities().first() {
            Some(first) => {
                self.set_active(first);
                eprintln!("Switched to {}", first);
                true
            }
            None => false,
        }
    }
}
