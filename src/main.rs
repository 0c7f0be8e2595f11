//! `acme-dns01` command line.
#[macro_use]
extern crate log;

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use acme_dns01::config::AccountFile;
use acme_dns01::dns::cloudflare::Cloudflare;
use acme_dns01::dns::propagation::{PropagationChecker, SystemResolver, TxtAnswer};
use acme_dns01::dns::DnsProvider;
use acme_dns01::orchestrator::{clean, refetch};
use acme_dns01::persist::FilePersist;
use acme_dns01::zone::{self, ZoneList, ZoneRecord};
use acme_dns01::{
    Account, CertificateMaterializer, Config, CsrStateStore, Directory, DirectoryUrl, Error,
    ErrorKind, KeyAlgorithm, OrderOrchestrator, Result, ResumePoint,
};

/// Issue certificates through ACME dns-01 challenges published on Cloudflare.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// State file listing the domains and the progress of the current order
    #[arg(long, env = "ACME_STATE", value_name = "FILE", default_value = "csrList.yaml")]
    state: PathBuf,

    /// Zone list (YAML). Without it the zones are read from the provider
    #[arg(long, env = "ACME_ZONES", value_name = "FILE")]
    zones: Option<PathBuf>,

    /// Where certificates and their keys are written
    #[arg(long, env = "ACME_CERT_DIR", value_name = "DIR")]
    cert_dir: Option<PathBuf>,

    /// Where the account key and contacts.yaml live
    #[arg(long, env = "ACME_ACCOUNT_DIR", value_name = "DIR", default_value = ".")]
    account_dir: PathBuf,

    /// Account name, selects the account key file
    #[arg(long, env = "ACME_ACCOUNT", default_value = "default")]
    account: String,

    /// Cloudflare API token with Zone:Read and DNS:Edit
    #[arg(long, env = "CF_API_TOKEN", hide_env_values = true)]
    cf_token: Option<String>,

    /// ACME directory url
    #[arg(long, env = "ACME_DIRECTORY", conflicts_with = "staging")]
    directory: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[arg(long)]
    staging: bool,

    /// More logging, repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) an order for the domains in the state file
    Issue(IssueArgs),
    /// Delete all challenge records of the state file's domains and reset the state
    Clean,
    /// Look up the challenge record of every domain
    Check {
        /// Name servers to ask instead of the system resolver
        #[arg(long, value_delimiter = ',')]
        nameservers: Vec<IpAddr>,
    },
    /// Create the CA account, or verify the existing one
    Account {
        /// Create the account (and key) if it doesn't exist
        #[arg(long)]
        create: bool,
    },
    /// Download the certificates at the stored urls again
    Fetch,
    /// Print the state file
    Show,
    /// Export the provider's zones as YAML
    Zones {
        /// Write to this file instead of stdout
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
}

#[derive(Args)]
struct IssueArgs {
    /// One order (and certificate) per domain instead of one for all
    #[arg(long)]
    individual: bool,

    /// Don't look for stale records before the run and trust the state file
    #[arg(long)]
    skip_propagation_check: bool,

    /// Seconds to wait after publishing before the first lookup
    #[arg(long, value_name = "N", default_value_t = 2)]
    settle_secs: u64,

    /// Lookups per record before giving up
    #[arg(long, value_name = "N", default_value_t = 5)]
    attempts: u32,

    /// Seconds between lookups
    #[arg(long, value_name = "N", default_value_t = 10)]
    backoff_secs: u64,

    /// Only accept the exact published value as propagated
    #[arg(long)]
    exact: bool,

    /// Name servers to ask instead of the system resolver
    #[arg(long, value_delimiter = ',')]
    nameservers: Vec<IpAddr>,

    /// Certificate key algorithm: p256, p384 or rsa2048
    #[arg(long, value_name = "ALG", default_value = "p256")]
    key: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match exec(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            match e.kind() {
                ErrorKind::Configuration => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn exec(cli: Cli) -> Result<()> {
    let store = CsrStateStore::new(&cli.state);
    match &cli.command {
        Command::Issue(args) => issue(&cli, args, &store),
        Command::Clean => {
            let mut state = store.load()?;
            let cloudflare = cloudflare(&cli)?;
            let zones = zones(&cli, &cloudflare)?;
            let deleted = clean(cloudflare, &store, &mut state, &zones)?;
            info!("Removed {} challenge record(s)", deleted);
            Ok(())
        }
        Command::Check { nameservers } => {
            let state = store.load()?;
            let config = config(&cli, None, state.cert_dir.as_deref())?;
            let resolver = SystemResolver::new(nameservers)?;
            let checker = PropagationChecker::new(resolver, config.propagation);
            for d in &state.domains {
                match checker.lookup(&d.domain)? {
                    TxtAnswer::NoRecord => println!("{}: no record", d.domain),
                    TxtAnswer::Records(values) => {
                        let known = values.iter().any(|v| *v == d.challenge.token_value);
                        let mark = if known { "" } else { " (not in state)" };
                        println!("{}: {}{}", d.domain, values.join(" "), mark);
                    }
                }
            }
            Ok(())
        }
        Command::Account { create } => {
            let config = config(&cli, None, None)?;
            let account = account(&config, *create)?;
            println!("{}", account.key_id());
            Ok(())
        }
        Command::Fetch => {
            let state = store.load()?;
            let config = config(&cli, None, state.cert_dir.as_deref())?;
            config.validate()?;
            let account = account(&config, false)?;
            let materializer = CertificateMaterializer::new(FilePersist::new(&config.cert_dir));
            for primary in refetch(&account, &materializer, &state)? {
                info!("Rewrote certificate for {}", primary);
            }
            Ok(())
        }
        Command::Show => {
            let state = store.load()?;
            print!("{}", serde_yaml::to_string(&state)?);
            Ok(())
        }
        Command::Zones { out } => {
            let list = ZoneList {
                zones: cloudflare(&cli)?.list_zones()?,
            };
            match out {
                Some(path) => {
                    list.save(path)?;
                    info!("Wrote {} zone(s) to {}", list.zones.len(), path.display());
                }
                None => print!("{}", serde_yaml::to_string(&list)?),
            }
            Ok(())
        }
    }
}

fn issue(cli: &Cli, args: &IssueArgs, store: &CsrStateStore) -> Result<()> {
    let mut state = store.load()?;
    // refuse a broken state file before anything goes over the network
    ResumePoint::of(&state)?;
    let file_zones = zone_file(cli)?;
    if let Some(zones) = &file_zones {
        zone::resolve(&state.domain_names(), zones)?;
    }
    let config = config(cli, Some(args), state.cert_dir.as_deref())?;
    config.validate()?;

    let cloudflare = cloudflare(cli)?;
    let zones = match file_zones {
        Some(zones) => zones,
        None => zones(cli, &cloudflare)?,
    };
    let resolver = SystemResolver::new(&config.propagation.nameservers)?;
    let account = account(&config, true)?;
    let persist = FilePersist::new(&config.cert_dir);

    let mut orchestrator = OrderOrchestrator::new(config, account, cloudflare, resolver, persist);
    let report = orchestrator.run(&mut state, &zones)?;

    for cert in &report.certificates {
        match cert.days_left {
            Some(days) => info!("{}: valid for {} days", cert.domains.join(", "), days),
            None => info!("{}: issued", cert.domains.join(", ")),
        }
    }
    Ok(())
}

fn config(cli: &Cli, issue: Option<&IssueArgs>, state_cert_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config {
        state_file: cli.state.clone(),
        zone_file: cli.zones.clone(),
        account_dir: cli.account_dir.clone(),
        account: cli.account.clone(),
        ..Default::default()
    };
    // the command line wins over the state file
    if let Some(dir) = cli.cert_dir.as_deref().or(state_cert_dir) {
        config.cert_dir = dir.to_path_buf();
    }
    if let Some(url) = &cli.directory {
        config.directory_url = url.clone();
    } else if cli.staging {
        config.directory_url = DirectoryUrl::LetsEncryptStaging.to_url().into();
    }
    if let Some(args) = issue {
        config.batch_mode = !args.individual;
        config.skip_propagation_check = args.skip_propagation_check;
        config.key_algorithm = args.key.parse::<KeyAlgorithm>()?;
        config.propagation.settle = Duration::from_secs(args.settle_secs);
        config.propagation.max_attempts = args.attempts;
        config.propagation.backoff = Duration::from_secs(args.backoff_secs);
        config.propagation.require_exact_value = args.exact;
        config.propagation.nameservers = args.nameservers.clone();
    }
    Ok(config)
}

fn cloudflare(cli: &Cli) -> Result<Cloudflare> {
    match cli.cf_token.as_deref() {
        Some(token) if !token.is_empty() => Ok(Cloudflare::new(token)),
        _ => Err(Error::Config(
            "no Cloudflare API token, use --cf-token or CF_API_TOKEN".into(),
        )),
    }
}

fn zone_file(cli: &Cli) -> Result<Option<Vec<ZoneRecord>>> {
    match &cli.zones {
        Some(path) => Ok(Some(ZoneList::load(path)?.zones)),
        None => Ok(None),
    }
}

fn zones(cli: &Cli, cloudflare: &Cloudflare) -> Result<Vec<ZoneRecord>> {
    match zone_file(cli)? {
        Some(zones) => Ok(zones),
        None => {
            debug!("No zone file, reading zones from Cloudflare");
            cloudflare.list_zones()
        }
    }
}

fn account(config: &Config, create: bool) -> Result<Account> {
    let persist = FilePersist::new(&config.account_dir);
    let url = DirectoryUrl::Other(&config.directory_url);
    let dir = Directory::from_url(persist, url, config.order_poll.clone())?;
    if !create {
        return dir.existing_account(&config.account);
    }
    let contacts_file = config.contacts_file();
    let contacts = if contacts_file.is_file() {
        AccountFile::load(&contacts_file)?.contacts
    } else {
        warn!("No {}, registering without contacts", contacts_file.display());
        vec![]
    };
    dir.account_with_realm(&config.account, contacts)
}
