use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "multivpn")]
#[command(about = "Userspace multi-link VPN packet dispatcher")]
pub struct Args {
    #[arg(default_value = "/etc/multivpn.cfg", help = "path to the config file")]
    pub config: String,

    #[arg(long, default_value = "info", help = "log level (debug, info, warn, error)")]
    pub log_level: String,

    #[arg(
        long,
        help = "classify announcements by unconditioned 'SES:' prefix instead of the hardened, length/charset/known-link-bounded classifier"
    )]
    pub compat_unsafe_classify: bool,
}
