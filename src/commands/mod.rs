use itertools::Itertools;
use std::env;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{self, NetConf, PluginSettings};
use crate::error::{CniError, Result};
use crate::ipam::Allocator;
use crate::k8s::KubePodMetadata;
use crate::plugin::{HostGatewayPlugin, IpRoute2};
use crate::registry::CniManager;
use crate::store::{FileStore, Store};
use crate::types::{CmdArgs, ErrorDocument};
use crate::version::{self, PluginInfo};

pub const CMD_ADD: &str = "ADD";
pub const CMD_DEL: &str = "DEL";
pub const CMD_CHECK: &str = "CHECK";
pub const CMD_VERSION: &str = "VERSION";

/// Environment variables read per invocation, with the commands that require them
const ENV_VARS: &[(&str, &[&str])] = &[
    ("CNI_COMMAND", &[CMD_ADD, CMD_CHECK, CMD_DEL]),
    ("CNI_CONTAINERID", &[CMD_ADD, CMD_CHECK, CMD_DEL]),
    ("CNI_NETNS", &[CMD_ADD, CMD_CHECK]),
    ("CNI_IFNAME", &[CMD_ADD, CMD_CHECK, CMD_DEL]),
    ("CNI_ARGS", &[]),
    ("CNI_PATH", &[CMD_ADD, CMD_CHECK, CMD_DEL]),
];

/// Operation handlers invoked once the environment has been validated
pub trait CniCommands {
    fn add(&mut self, args: &CmdArgs, out: &mut dyn Write) -> Result<()>;

    fn check(&mut self, args: &CmdArgs, out: &mut dyn Write) -> Result<()>;

    fn del(&mut self, args: &CmdArgs, out: &mut dyn Write) -> Result<()>;
}

/// Reads the invocation from the environment and stdin and routes it.
pub struct Dispatcher<'a> {
    getenv: Box<dyn Fn(&str) -> Option<String> + 'a>,
    stdin: Box<dyn Read + 'a>,
    stdout: Box<dyn Write + 'a>,
    stderr: Box<dyn Write + 'a>,
}

impl Dispatcher<'static> {
    pub fn from_process() -> Self {
        Self::new(
            |name| env::var(name).ok(),
            io::stdin(),
            io::stdout(),
            io::stderr(),
        )
    }
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        getenv: impl Fn(&str) -> Option<String> + 'a,
        stdin: impl Read + 'a,
        stdout: impl Write + 'a,
        stderr: impl Write + 'a,
    ) -> Self {
        Self {
            getenv: Box::new(getenv),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// An empty variable counts as unset.
    fn var(&self, name: &str) -> Option<String> {
        (self.getenv)(name).filter(|value| !value.is_empty())
    }

    /// Collect the command and its arguments, naming every missing variable.
    pub fn cmd_args_from_env(&mut self) -> Result<(String, CmdArgs)> {
        let command = self.var("CNI_COMMAND").unwrap_or_default();
        let mut values = Vec::with_capacity(ENV_VARS.len());
        let mut missing = Vec::new();
        for (name, required_for) in ENV_VARS {
            let value = self.var(name);
            if value.is_none() && (*name == "CNI_COMMAND" || required_for.contains(&command.as_str())) {
                missing.push(*name);
            }
            values.push(value.unwrap_or_default());
        }
        if !missing.is_empty() {
            return Err(CniError::Environment(format!(
                "required env variables [{}] missing",
                missing.iter().join(",")
            )));
        }

        let mut stdin_data = Vec::new();
        if command != CMD_VERSION {
            self.stdin
                .read_to_end(&mut stdin_data)
                .map_err(|err| CniError::Io(format!("error reading from stdin: {err}")))?;
        }

        let mut values = values.into_iter().skip(1);
        let mut next = || values.next().unwrap_or_default();
        let args = CmdArgs {
            container_id: next(),
            netns: next(),
            ifname: next(),
            args: next(),
            path: next(),
            stdin_data,
        };
        Ok((command, args))
    }

    fn validate(args: &CmdArgs) -> Result<()> {
        config::validate_config(&args.stdin_data)?;
        config::validate_container_id(&args.container_id)?;
        config::validate_interface_name(&args.ifname)
    }

    fn check_version_and_call(
        &mut self,
        args: &CmdArgs,
        info: &PluginInfo,
        call: impl FnOnce(&CmdArgs, &mut dyn Write) -> Result<()>,
    ) -> Result<()> {
        let config_version = version::decode_config_version(&args.stdin_data)?;
        version::reconcile(&config_version, info)?;
        call(args, self.stdout.as_mut())
    }

    /// Run one invocation. Errors are returned, not printed.
    pub fn plugin_main(
        &mut self,
        commands: &mut dyn CniCommands,
        info: &PluginInfo,
        about: &str,
    ) -> Result<()> {
        if self.var("CNI_COMMAND").is_none() && !about.is_empty() {
            writeln!(self.stderr, "{about}")?;
            return Ok(());
        }

        let (command, args) = self.cmd_args_from_env()?;
        match command.as_str() {
            CMD_ADD => {
                Self::validate(&args)?;
                self.check_version_and_call(&args, info, |args, out| commands.add(args, out))
            }
            CMD_DEL => {
                Self::validate(&args)?;
                self.check_version_and_call(&args, info, |args, out| commands.del(args, out))
            }
            CMD_CHECK => {
                Self::validate(&args)?;
                let config_version = version::decode_config_version(&args.stdin_data)?;
                if !version::greater_than_or_equal_to(&config_version, version::CHECK_MIN_VERSION)? {
                    return Err(CniError::version(
                        "config version does not allow CHECK",
                        format!("config is {config_version:?}, CHECK needs {}", version::CHECK_MIN_VERSION),
                    ));
                }
                for plugin_version in info.supported_versions() {
                    if version::greater_than_or_equal_to(plugin_version, &config_version)? {
                        return self.check_version_and_call(&args, info, |args, out| {
                            commands.check(args, out)
                        });
                    }
                }
                Err(CniError::version(
                    "plugin version does not allow CHECK",
                    format!(
                        "config is {config_version:?}, plugin supports {:?}",
                        info.supported_versions()
                    ),
                ))
            }
            CMD_VERSION => info.encode(self.stdout.as_mut()),
            other => Err(CniError::Environment(format!("unknown CNI_COMMAND: {other}"))),
        }
    }

    /// Run one invocation and return the process exit status, writing the
    /// error document to stdout on failure.
    pub fn run(&mut self, commands: &mut dyn CniCommands, info: &PluginInfo, about: &str) -> i32 {
        match self.plugin_main(commands, info, about) {
            Ok(()) => 0,
            Err(err) => {
                error!("CNI plugin error: {}", err);
                if let Err(write_err) = ErrorDocument::from_error(&err).print(self.stdout.as_mut()) {
                    let _ = writeln!(self.stderr, "failed to write error document: {write_err}");
                }
                1
            }
        }
    }
}

fn log_invocation(operation: &str, args: &CmdArgs) {
    info!(
        container_id = %args.container_id,
        netns = %args.netns,
        ifname = %args.ifname,
        args = %args.args,
        path = %args.path,
        "{}",
        operation
    );
}

/// Parse the configuration and fill in the mode and version defaults.
fn prepare(args: &CmdArgs) -> Result<(String, NetConf)> {
    let mut conf = NetConf::parse(&args.stdin_data)?;
    let (mode, cni_version) = conf.base_info();
    conf.mode = mode.clone();
    conf.cni_version = cni_version;
    Ok((mode, conf))
}

/// Execute the add command
pub fn cmd_add(manager: &mut CniManager, args: &CmdArgs, out: &mut dyn Write) -> Result<()> {
    log_invocation("cmdAdd", args);
    let (mode, conf) = prepare(args)?;
    manager.set_bootstrap(&mode, args.clone(), conf).bootstrap_cni()?;
    manager.print_result(out)
}

/// Execute the delete command
pub fn cmd_del(manager: &mut CniManager, args: &CmdArgs) -> Result<()> {
    log_invocation("cmdDel", args);
    let (mode, conf) = prepare(args)?;
    manager.set_unmount(&mode, args.clone(), conf).unmount_cni()
}

/// Execute the check command
pub fn cmd_check(manager: &mut CniManager, args: &CmdArgs) -> Result<()> {
    log_invocation("cmdCheck", args);
    let (mode, conf) = prepare(args)?;
    manager.set_check(&mode, args.clone(), conf).check_cni()
}

/// [`CniCommands`] that build a fresh registry for every operation
pub struct PluginCommands<F> {
    build: F,
}

impl<F> PluginCommands<F>
where
    F: FnMut() -> Result<CniManager>,
{
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

impl<F> CniCommands for PluginCommands<F>
where
    F: FnMut() -> Result<CniManager>,
{
    fn add(&mut self, args: &CmdArgs, out: &mut dyn Write) -> Result<()> {
        let mut manager = (self.build)()?;
        cmd_add(&mut manager, args, out)
    }

    fn check(&mut self, args: &CmdArgs, _out: &mut dyn Write) -> Result<()> {
        let mut manager = (self.build)()?;
        cmd_check(&mut manager, args)
    }

    fn del(&mut self, args: &CmdArgs, _out: &mut dyn Write) -> Result<()> {
        let mut manager = (self.build)()?;
        cmd_del(&mut manager, args)
    }
}

/// Registry wired to the file store, the Kubernetes API and iproute2.
pub fn build_manager(settings: &PluginSettings) -> Result<CniManager> {
    let store: Arc<dyn Store> = Arc::new(FileStore::open(settings.store_dir.clone())?);
    let node_name = settings.resolve_node_name()?;
    let allocator = Allocator::new(store, &node_name);
    let pods = KubePodMetadata::new(settings.kubeconfig.clone())?;
    let plugin = HostGatewayPlugin::new(Box::new(pods), allocator, Box::new(IpRoute2::new()))
        .with_mtu(settings.mtu);

    let mut manager = CniManager::new();
    manager.register(Box::new(plugin))?;
    Ok(manager)
}

pub fn about() -> String {
    format!(
        "tinycni host-gateway CNI plugin v{}",
        env!("CARGO_PKG_VERSION")
    )
}

/// Main entry point for the CNI plugin, returning the exit status
pub fn run_cni(settings: &PluginSettings) -> i32 {
    let mut commands = PluginCommands::new(|| build_manager(settings));
    Dispatcher::from_process().run(&mut commands, &PluginInfo::all(), &about())
}
