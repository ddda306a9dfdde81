mod show;
mod watch;

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser as _;
use pcsc::Context;
use tagseal::codec;
use tagseal::config::Config;
use tagseal::definition::CardDefinition;
use tagseal::pcsc::{Reader, Signal};
use tagseal::reader::{Image, PageWriter, Protected};
use tagseal::service::{KeyService, StaticKeyService};
use tagseal::validator::Validator;
use tagseal::verify::Jwk;
use tap::TapFallible;
use tracing::{debug, info, trace, trace_span, warn};

#[derive(clap::Parser, Debug)]
#[command(about = "Reads and authenticates signed NFC badges")]
pub struct Args {
    /// Increase log level.
    #[arg(short, long, action=clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log level.
    #[arg(short, long, action=clap::ArgAction::Count)]
    quiet: u8,

    /// Use a specific reader (from list-readers).
    #[arg(short, long)]
    reader: Option<String>,

    /// Use a memory dump instead of a reader.
    #[arg(short, long, conflicts_with = "reader")]
    image: Option<PathBuf>,

    /// Issuer public key, as a JWK file. Skips the key service.
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Registration server, for keys and card passwords.
    #[arg(long, env = "TAGSEAL_SERVICE_URL")]
    service_url: Option<String>,

    /// Bearer token for the registration server.
    #[arg(long, env = "TAGSEAL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Don't try to unlock password-protected cards.
    #[arg(long)]
    no_unlock: bool,

    /// Command.
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// List connected readers.
    ListReaders,

    /// Identify the card on the reader.
    Info,

    /// Dump the records on a card.
    Read {
        /// Print as JSON, in the registration service's format.
        #[arg(short, long)]
        json: bool,
    },

    /// Check a card's signature.
    Verify,

    /// Write records to a card, from a JSON card definition.
    Write {
        /// Card definition file.
        definition: PathBuf,

        /// Only replace the fields the definition sets; keep everything else.
        #[arg(short, long)]
        update: bool,

        /// Card password (hex), if the card is protected.
        #[arg(short, long, value_parser = parse_password)]
        password: Option<u32>,
    },

    /// Validate every card that's presented, until interrupted.
    Watch,
}

fn parse_password(s: &str) -> std::result::Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|err| format!("{}: {}", s, err))
}

/// Where a command gets its card from.
enum Target {
    Image(PathBuf, Image),
    Card(CString, Reader),
}

impl Command {
    pub fn run(&self, args: &Args) -> Result<ExitCode> {
        match self {
            Self::ListReaders => self.list_readers(args),
            Self::Info => self.info(args),
            Self::Read { json } => self.read(args, *json),
            Self::Verify => self.verify(args),
            Self::Write {
                definition,
                update,
                password,
            } => self.write(args, definition, *update, *password),
            Self::Watch => watch::watch(args),
        }
    }

    fn list_readers(&self, _args: &Args) -> Result<ExitCode> {
        let span = trace_span!("list_readers");
        let _enter = span.enter();

        let ctx = Context::establish(pcsc::Scope::User)?;
        let mut readers_buf = [0; 2048];
        for name in ctx.list_readers(&mut readers_buf)? {
            let name = name.to_str()?;
            if is_ignored_reader(name) {
                println!("{} {}", name, show::dim("(ignored)"));
            } else {
                println!("{}", name);
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn info(&self, args: &Args) -> Result<ExitCode> {
        let span = trace_span!("info");
        let _enter = span.enter();

        match open_target(args)? {
            Target::Image(path, mut img) => {
                show::image_info(&path, &mut img)?;
            }
            Target::Card(name, mut rdr) => {
                let uid = rdr
                    .uid()
                    .tap_err(|err| warn!(%err, "Couldn't read UID"))
                    .ok();
                show::card_info(&name, &rdr, uid.as_deref());
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn read(&self, args: &Args, json: bool) -> Result<ExitCode> {
        let span = trace_span!("read");
        let _enter = span.enter();

        let tags = match open_target(args)? {
            Target::Image(_, mut img) => codec::decode(&mut img)?,
            Target::Card(_, mut rdr) => codec::decode(&mut rdr)?,
        };
        if json {
            let def = CardDefinition::from_tags(&tags)?;
            serde_json::to_writer_pretty(std::io::stdout().lock(), &def)?;
            println!();
        } else {
            show::tags(&tags);
        }
        Ok(ExitCode::SUCCESS)
    }

    fn verify(&self, args: &Args) -> Result<ExitCode> {
        let span = trace_span!("verify");
        let _enter = span.enter();

        let mut validator = Validator::new(key_service(args)?, config(args));
        let (res, reader) = match open_target(args)? {
            Target::Image(_, mut img) => (validator.validate_protected(&mut img), None),
            Target::Card(_, mut rdr) => (validator.validate_protected(&mut rdr), Some(rdr)),
        };
        let code = match &res {
            Ok(v) => {
                show::tags(&v.tags);
                show::validation(v, chrono::Utc::now());
                if v.is_authentic() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(1)
                }
            }
            Err(err) => {
                show::error(err);
                ExitCode::from(2)
            }
        };
        if let Some(mut rdr) = reader {
            let signal = match &res {
                Ok(v) if v.is_authentic() => Signal::success(),
                _ => Signal::failure(),
            };
            let _ = rdr
                .signal(signal)
                .tap_err(|err| debug!(%err, "Couldn't beep"));
        }
        Ok(code)
    }

    fn write(
        &self,
        args: &Args,
        definition: &Path,
        update: bool,
        password: Option<u32>,
    ) -> Result<ExitCode> {
        let span = trace_span!("write");
        let _enter = span.enter();

        let def: CardDefinition = serde_json::from_reader(
            std::fs::File::open(definition)
                .with_context(|| format!("couldn't open {}", definition.display()))?,
        )
        .with_context(|| format!("couldn't parse {}", definition.display()))?;
        debug!(?def, "Loaded card definition");

        match open_target(args)? {
            Target::Image(path, mut img) => {
                write_tags(&mut img, &def, update, password)?;
                std::fs::write(&path, img.memory())
                    .with_context(|| format!("couldn't save {}", path.display()))?;
            }
            Target::Card(_, mut rdr) => {
                let res = write_tags(&mut rdr, &def, update, password);
                let signal = match res {
                    Ok(_) => Signal::success(),
                    Err(_) => Signal::failure(),
                };
                let _ = rdr
                    .signal(signal)
                    .tap_err(|err| debug!(%err, "Couldn't beep"));
                res?;
            }
        }
        Ok(ExitCode::SUCCESS)
    }
}

fn write_tags<W: PageWriter + Protected + ?Sized>(
    card: &mut W,
    def: &CardDefinition,
    update: bool,
    password: Option<u32>,
) -> Result<()> {
    if let Some(password) = password {
        card.unlock(password).context("couldn't unlock card")?;
    }
    let tags = if update {
        def.apply(&codec::decode(card).context("couldn't read current records")?)?
    } else {
        def.to_tags()?
    };
    codec::write(card, &tags)?;

    let readback = codec::decode(card).context("couldn't read back records")?;
    if readback != tags {
        return Err(anyhow!("records read back don't match what was written"));
    }
    info!(tags = tags.len(), "Wrote card");
    show::tags(&tags);
    Ok(())
}

pub fn config(args: &Args) -> Config {
    Config::new()
        .with_unlock(!args.no_unlock)
        .with_service_url(args.service_url.clone())
        .with_token(args.token.clone())
}

/// A JWK file if one was given, otherwise the registration server.
pub fn key_service(args: &Args) -> Result<Box<dyn KeyService>> {
    let http = config(args).key_service()?;
    match (&args.key, http) {
        (Some(path), _) => {
            let key: Jwk = serde_json::from_reader(
                std::fs::File::open(path)
                    .with_context(|| format!("couldn't open {}", path.display()))?,
            )
            .with_context(|| format!("couldn't parse {}", path.display()))?;
            Ok(Box::new(StaticKeyService::new(key)))
        }
        (None, Some(svc)) => Ok(Box::new(svc)),
        (None, None) => Err(anyhow!("need either --key or --service-url")),
    }
}

/// Readers that show up as PC/SC devices, but aren't NFC readers.
fn is_ignored_reader(name: &str) -> bool {
    name.to_lowercase().contains("yubico")
}

pub fn select_reader(ctx: &Context, name_: &Option<String>) -> Result<CString> {
    let span = trace_span!("select_reader", name_);
    let _enter = span.enter();

    if let Some(name) = name_ {
        // If the --reader flag is passed, use the reader name verbatim.
        return Ok(CString::new(name.clone())?);
    }
    // If not, use the first NFC reader.
    let mut readers_buf = [0; 2048];
    debug!("Listing available readers");
    let name = ctx
        .list_readers(&mut readers_buf)?
        .find(|name| {
            let ignored = is_ignored_reader(&name.to_string_lossy());
            if ignored {
                debug!(?name, "Ignoring reader");
            }
            !ignored
        })
        .ok_or(anyhow!("No supported reader connected"))?;
    debug!(?name, "Using first available reader");
    Ok(name.to_owned())
}

pub fn connect(ctx: &Context, name: &CStr) -> Result<Reader> {
    Reader::connect(ctx, name).with_context(|| format!("couldn't connect to {:?}", name))
}

fn open_target(args: &Args) -> Result<Target> {
    if let Some(path) = &args.image {
        let dump =
            std::fs::read(path).with_context(|| format!("couldn't read {}", path.display()))?;
        return Ok(Target::Image(path.clone(), Image::from_dump(dump)));
    }
    let ctx = Context::establish(pcsc::Scope::User)?;
    let name = select_reader(&ctx, &args.reader)?;
    let rdr = connect(&ctx, &name)?;
    Ok(Target::Card(name, rdr))
}

fn init_logging(args: &Args) {
    tracing_subscriber::fmt()
        .without_time()
        .with_target(false)
        .with_max_level(match 2 + args.verbose as i16 - args.quiet as i16 {
            ..=0 => tracing::Level::ERROR,
            1 => tracing::Level::WARN,
            2 => tracing::Level::INFO,
            3 => tracing::Level::DEBUG,
            4.. => tracing::Level::TRACE,
        })
        .init();
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args);
    trace!(?args, "Starting up");
    args.command.run(&args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_password() {
        assert_eq!(parse_password("C0FFEE00").unwrap(), 0xC0FFEE00);
        assert_eq!(parse_password("0xdeadbeef").unwrap(), 0xDEADBEEF);
        assert!(parse_password("hunter2").is_err());
        assert!(parse_password("123456789").is_err());
    }

    #[test]
    fn test_is_ignored_reader() {
        assert!(is_ignored_reader("Yubico YubiKey OTP+FIDO+CCID 00 00"));
        assert!(!is_ignored_reader("ACS ACR122U PICC Interface 00 00"));
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "tagseal",
            "-vv",
            "--image",
            "badge.bin",
            "--key",
            "key.jwk",
            "write",
            "--update",
            "-p",
            "0xC0FFEE00",
            "def.json",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        match args.command {
            Command::Write {
                update, password, ..
            } => {
                assert!(update);
                assert_eq!(password, Some(0xC0FFEE00));
            }
            cmd => panic!("wrong command: {:?}", cmd),
        }
        assert!(Args::try_parse_from(["tagseal", "-r", "x", "-i", "y", "read"]).is_err());
    }
}
