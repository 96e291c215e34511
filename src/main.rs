use clap::Parser;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::io;
use std::net::{IpAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

const COMPOSE_TOOL: &str = "docker-compose";
const ENV_KEYWORD: &str = "env";
const LOOPBACK_PLACEHOLDER: &str = "localhost";
const DAEMON_UNAVAILABLE_SIGNATURE: &str = "Couldn't connect to Docker daemon";
const OUTBOUND_IP_ENV: &str = "DOCKHAND_OUTBOUND_IP";
const EXTRA_PATH_DIR: &str = "/usr/local/bin";

const ICON_STACK: &str = "docker.png";
const ICON_RUNNING: &str = "On.png";
const ICON_STOPPED: &str = "Off.png";
const ICON_CONFIGURE: &str = "plus.png";

#[derive(Parser, Debug)]
#[command(name = "dockhand", version, about = "Compose stack items for launcher menus")]
struct Cli {
    /// Search token handed over by the launcher.
    query: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    init_config: bool,
}

#[derive(Debug, Error)]
enum DockhandError {
    #[error("cannot read config: {0}")]
    ConfigUnreadable(String),
    #[error("cannot parse config: {0}")]
    ConfigMalformed(String),
    #[error("compose manifest missing: {0}")]
    ManifestMissing(String),
    #[error("cannot parse compose manifest: {0}")]
    ManifestMalformed(String),
    #[error("container runtime is unavailable")]
    RuntimeUnavailable,
    #[error("status query failed: {0}")]
    StateQueryFailed(String),
    #[error("no outbound route: {0}")]
    NoOutboundRoute(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize, Clone)]
struct Profile {
    #[serde(default)]
    filepath: String,
    #[serde(default)]
    environment: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ComposeManifest {
    #[serde(default)]
    services: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Default, Serialize)]
struct Feedback {
    items: Vec<Item>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    variables: BTreeMap<String, String>,
}

impl Feedback {
    fn single(item: Item) -> Self {
        Feedback {
            items: vec![item],
            variables: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct Item {
    title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    subtitle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    arg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    autocomplete: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<Icon>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    variables: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    mods: BTreeMap<String, Mod>,
}

#[derive(Debug, Serialize)]
struct Icon {
    path: String,
}

#[derive(Debug, Serialize)]
struct Mod {
    subtitle: String,
    arg: String,
}

impl Item {
    fn new(title: impl Into<String>, subtitle: impl Into<String>) -> Self {
        Item {
            title: title.into(),
            subtitle: subtitle.into(),
            ..Item::default()
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }

    fn autocomplete(mut self, token: impl Into<String>) -> Self {
        self.autocomplete = Some(token.into());
        self
    }

    fn icon(mut self, path: &str) -> Self {
        self.icon = Some(Icon {
            path: path.to_string(),
        });
        self
    }

    fn variable(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }

    fn alt_action(mut self, subtitle: &str, arg: String) -> Self {
        self.mods.insert(
            "alt".to_string(),
            Mod {
                subtitle: subtitle.to_string(),
                arg,
            },
        );
        self
    }

    fn cmd_action(mut self, subtitle: &str, arg: String) -> Self {
        self.mods.insert(
            "cmd".to_string(),
            Mod {
                subtitle: subtitle.to_string(),
                arg,
            },
        );
        self
    }
}

#[derive(Debug)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }

    fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

trait StatusRunner {
    fn run(
        &self,
        command: &str,
        env_overrides: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, io::Error>;
}

struct ShellStatusRunner;

impl StatusRunner for ShellStatusRunner {
    fn run(
        &self,
        command: &str,
        env_overrides: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        let output = cmd.output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn main() {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(feedback) => {
            if let Err(err) = print_json(&feedback) {
                eprintln!("{err}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            let fallback = Feedback::single(Item::new("Unexpected error", err.to_string()));
            let _ = print_json(&fallback);
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<Feedback, DockhandError> {
    let config_path = resolve_config_path(cli.config.as_ref());
    if cli.init_config {
        return init_config(&config_path);
    }
    let token = cli.query.as_deref().unwrap_or("");

    let profiles = match load_profiles(&config_path) {
        Ok(profiles) => profiles,
        Err(DockhandError::ConfigUnreadable(_)) => {
            return Ok(Feedback::single(configure_item(
                "Reading config file error",
                "Modify Configuration",
                &config_path,
            )));
        }
        Err(DockhandError::ConfigMalformed(_)) => {
            return Ok(Feedback::single(configure_item(
                "Parsing config file error",
                "Modify Configuration",
                &config_path,
            )));
        }
        Err(err) => return Err(err),
    };

    let Some(profile) = profiles.get(token) else {
        return Ok(profile_menu(&profiles, &config_path));
    };

    let services = match load_manifest(Path::new(&profile.filepath)) {
        Ok(services) => services,
        Err(DockhandError::ManifestMissing(_)) => {
            return Ok(Feedback::single(configure_item(
                "Can not read compose manifest",
                "Set compose manifest path",
                &config_path,
            )));
        }
        Err(DockhandError::ManifestMalformed(_)) => {
            return Ok(Feedback::single(parse_failure_item()));
        }
        Err(err) => return Err(err),
    };

    let address = outbound_address(env::var(OUTBOUND_IP_ENV).ok().as_deref())?;
    let prefix = environment_prefix(&profile.environment, address);
    let base = base_command(&prefix, &profile.filepath);
    let environment = scoped_environment();

    let running = match probe_runtime(&ShellStatusRunner, &base, &environment) {
        Ok(output) => running_services(&output, &services),
        Err(DockhandError::RuntimeUnavailable) => {
            return Ok(Feedback::single(start_runtime_item()));
        }
        Err(DockhandError::StateQueryFailed(_)) => {
            return Ok(Feedback::single(parse_failure_item()));
        }
        Err(err) => return Err(err),
    };

    Ok(action_feedback(&base, &services, &running))
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("DOCKHAND_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("DOCKHAND_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("dockhand");
    base
}

fn ensure_parent(path: &Path) -> Result<(), DockhandError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn init_config(config_path: &Path) -> Result<Feedback, DockhandError> {
    if config_path.exists() {
        return Ok(Feedback::single(
            Item::new("Configuration already exists", config_path.to_string_lossy())
                .icon(ICON_CONFIGURE)
                .arg(config_path.to_string_lossy())
                .variable("cmd", "filewrite"),
        ));
    }
    ensure_parent(config_path)?;
    fs::write(config_path, DEFAULT_CONFIG_YAML)?;
    Ok(Feedback::single(
        Item::new(
            "Created starter configuration",
            config_path.to_string_lossy(),
        )
        .icon(ICON_CONFIGURE)
        .arg(config_path.to_string_lossy())
        .variable("cmd", "filewrite"),
    ))
}

fn load_profiles(path: &Path) -> Result<BTreeMap<String, Profile>, DockhandError> {
    let content = fs::read_to_string(path)
        .map_err(|err| DockhandError::ConfigUnreadable(err.to_string()))?;
    serde_yaml::from_str(&content).map_err(|err| DockhandError::ConfigMalformed(err.to_string()))
}

fn load_manifest(path: &Path) -> Result<Vec<String>, DockhandError> {
    if !path.exists() {
        return Err(DockhandError::ManifestMissing(
            path.to_string_lossy().into_owned(),
        ));
    }
    let content =
        fs::read_to_string(path).map_err(|err| DockhandError::ManifestMissing(err.to_string()))?;
    let manifest: ComposeManifest = serde_yaml::from_str(&content)
        .map_err(|err| DockhandError::ManifestMalformed(err.to_string()))?;
    Ok(manifest.services.into_keys().collect())
}

fn outbound_address(override_value: Option<&str>) -> Result<IpAddr, DockhandError> {
    if let Some(value) = override_value {
        return value.parse().map_err(|_| {
            DockhandError::NoOutboundRoute(format!("invalid {OUTBOUND_IP_ENV} value: {value}"))
        });
    }
    // connect() on a UDP socket only consults the routing table; nothing is sent.
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .map_err(|err| DockhandError::NoOutboundRoute(err.to_string()))?;
    socket
        .connect(("8.8.8.8", 80))
        .map_err(|err| DockhandError::NoOutboundRoute(err.to_string()))?;
    let local = socket
        .local_addr()
        .map_err(|err| DockhandError::NoOutboundRoute(err.to_string()))?;
    Ok(local.ip())
}

fn environment_prefix(overrides: &[String], address: IpAddr) -> String {
    if overrides.is_empty() {
        return String::new();
    }
    let address = address.to_string();
    let mut parts = vec![ENV_KEYWORD.to_string()];
    for entry in overrides {
        parts.push(entry.replace(LOOPBACK_PLACEHOLDER, &address));
    }
    parts.join(" ")
}

fn base_command(prefix: &str, manifest_path: &str) -> String {
    if prefix.is_empty() {
        format!("{COMPOSE_TOOL} -f {manifest_path}")
    } else {
        format!("{prefix} {COMPOSE_TOOL} -f {manifest_path}")
    }
}

fn extended_path(path: &str) -> String {
    if path.split(':').any(|dir| dir == EXTRA_PATH_DIR) {
        return path.to_string();
    }
    if path.is_empty() {
        return EXTRA_PATH_DIR.to_string();
    }
    format!("{path}:{EXTRA_PATH_DIR}")
}

// The probe subprocess gets its own PATH; the parent environment is never mutated.
fn scoped_environment() -> BTreeMap<String, String> {
    let path = extended_path(&env::var("PATH").unwrap_or_default());
    BTreeMap::from([(String::from("PATH"), path)])
}

fn probe_runtime<R: StatusRunner>(
    runner: &R,
    base: &str,
    environment: &BTreeMap<String, String>,
) -> Result<String, DockhandError> {
    if which::which_in(COMPOSE_TOOL, environment.get("PATH"), ".").is_err() {
        return Err(DockhandError::StateQueryFailed(format!(
            "{COMPOSE_TOOL} not found on the probe PATH"
        )));
    }
    let output = runner
        .run(&format!("{base} ps"), environment)
        .map_err(|err| DockhandError::StateQueryFailed(err.to_string()))?;
    let combined = output.combined();
    // The daemon signature wins over the exit code: a down daemon also exits non-zero.
    if combined.contains(DAEMON_UNAVAILABLE_SIGNATURE) {
        return Err(DockhandError::RuntimeUnavailable);
    }
    if !output.success() {
        return Err(DockhandError::StateQueryFailed(format!(
            "status query exited with code {}",
            output.status_code
        )));
    }
    Ok(up_names(&combined))
}

// First column of every `ps` line reporting Up. Stopped containers are listed
// too, so matching against the raw listing would classify everything running.
fn up_names(raw: &str) -> String {
    raw.lines()
        .filter(|line| line.contains("Up"))
        .filter_map(|line| line.split_whitespace().next())
        .collect::<Vec<_>>()
        .join("\n")
}

fn running_services(output: &str, services: &[String]) -> BTreeSet<String> {
    services
        .iter()
        .filter(|name| output.contains(name.as_str()))
        .cloned()
        .collect()
}

fn configure_item(title: &str, subtitle: &str, config_path: &Path) -> Item {
    Item::new(title, subtitle)
        .icon(ICON_CONFIGURE)
        .arg(config_path.to_string_lossy())
        .variable("cmd", "filewrite")
}

fn parse_failure_item() -> Item {
    Item::new(
        "Can not parse compose manifest",
        "check that the yaml file is well formed",
    )
}

fn start_runtime_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "open -a Docker"
    } else {
        "systemctl start docker"
    }
}

fn start_runtime_item() -> Item {
    Item::new("Docker daemon is not running", "start Docker")
        .icon(ICON_STACK)
        .arg(start_runtime_command())
}

fn profile_menu(profiles: &BTreeMap<String, Profile>, config_path: &Path) -> Feedback {
    let mut items: Vec<Item> = profiles
        .iter()
        .map(|(name, profile)| {
            Item::new(format!("Select #{name}"), &profile.filepath)
                .icon(ICON_STACK)
                .autocomplete(name)
        })
        .collect();
    items.push(configure_item("Modify configuration", "", config_path));
    Feedback {
        items,
        variables: BTreeMap::new(),
    }
}

fn action_feedback(base: &str, services: &[String], running: &BTreeSet<String>) -> Feedback {
    let mut items = Vec::with_capacity(services.len() + 2);
    items.push(
        Item::new("All Services", "create & start all services")
            .icon(ICON_STACK)
            .arg(format!("{base} up -d"))
            .alt_action(
                "Recreate and start all services",
                format!("{base} up --force-recreate -d"),
            )
            .cmd_action("Stop all services", format!("{base} stop")),
    );
    items.push(
        Item::new("Check logs on terminal", "Open terminal and show logs")
            .icon(ICON_STACK)
            .arg(format!("{base} logs -f -t"))
            .variable("cmd", "terminal"),
    );
    for name in services {
        let item = if running.contains(name) {
            Item::new(name, "Stop service")
                .icon(ICON_RUNNING)
                .arg(format!("{base} stop {name}"))
        } else {
            Item::new(name, "Start service")
                .icon(ICON_STOPPED)
                .arg(format!("{base} up -d {name}"))
        };
        items.push(item.alt_action(
            "Recreate and start service",
            format!("{base} up --force-recreate -d {name}"),
        ));
    }
    Feedback {
        items,
        variables: BTreeMap::from([(String::from("cmd"), String::from("bash"))]),
    }
}

fn print_json(feedback: &Feedback) -> Result<(), DockhandError> {
    let text = serde_json::to_string_pretty(feedback)?;
    println!("{text}");
    Ok(())
}
