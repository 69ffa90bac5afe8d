//! CLI surface (spec.md §6): `argh`-based arguments, in the same style
//! as the teacher's `cli.rs` (doc comments double as `--help` text).

use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
/// mirror every configured repository (or just the given ids); this is
/// also the default action when no subcommand is given
#[argh(subcommand, name = "sync")]
pub struct Sync {
    /// mirror ids to update; empty means all configured mirrors
    #[argh(positional)]
    pub ids: Vec<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// parse and validate the configuration file, then exit
#[argh(subcommand, name = "validate")]
pub struct Validate {}

#[derive(FromArgs, PartialEq, Debug)]
/// print the version and exit
#[argh(subcommand, name = "version")]
pub struct Version {}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Command {
    Sync(Sync),
    Validate(Validate),
    Version(Version),
}

#[derive(FromArgs, PartialEq, Debug)]
/// mirrorctl: a bit-exact, cryptographically verified Debian/APT mirroring engine
pub struct Args {
    /// path to the TOML configuration file
    #[argh(option, short = 'c')]
    pub config: String,

    /// override the configured log level (trace, debug, info, warn, error)
    #[argh(option, short = 'l')]
    pub log_level: Option<String>,

    /// disable PGP signature verification for every mirror
    #[argh(switch)]
    pub no_pgp_check: bool,

    /// print full error chains instead of a one-line summary
    #[argh(switch)]
    pub verbose_errors: bool,

    /// suppress informational output
    #[argh(switch, short = 'q')]
    pub quiet: bool,

    /// run every phase except the final package/index fetch
    #[argh(switch)]
    pub dry_run: bool,

    /// override safety checks that would otherwise refuse an operation
    /// (overwriting an existing snapshot, deleting a published one, ...)
    #[argh(switch)]
    pub force: bool,

    #[argh(subcommand)]
    pub command: Option<Command>,
}
