//! Tab-separated configuration file: `link` / `local` / `route` records.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::Path;

/// `src` of a link: either an interface name to watch, or a literal address
/// that never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Interface(String),
    Literal(String),
}

impl Source {
    fn parse(field: &str) -> Self {
        if field.parse::<std::net::IpAddr>().is_ok() {
            Source::Literal(field.to_string())
        } else {
            Source::Interface(field.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkOptions {
    pub bind: bool,
    pub reuse: bool,
}

impl LinkOptions {
    fn parse(field: Option<&str>) -> Self {
        let mut opts = LinkOptions::default();
        let Some(field) = field else { return opts };
        for tok in field.split(',') {
            match tok.trim().to_ascii_lowercase().as_str() {
                "bind" => opts.bind = true,
                "reuse" => opts.reuse = true,
                "" => {}
                _ => {}
            }
        }
        opts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub name: String,
    pub src: Source,
    pub srcport: u16,
    pub dstip: Option<String>,
    pub dstport: Option<u16>,
    pub factor: u32,
    pub options: LinkOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalOptions {
    pub tap: bool,
}

impl LocalOptions {
    fn parse(field: Option<&str>) -> Self {
        let mut opts = LocalOptions::default();
        let Some(field) = field else { return opts };
        for tok in field.split(',') {
            if tok.trim().eq_ignore_ascii_case("tap") {
                opts.tap = true;
            }
        }
        opts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub ip: String,
    pub mask: u8,
    pub mtu: u32,
    pub dstip: Option<String>,
    pub options: LocalOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub to: String,
    pub mask: u8,
    pub gw: String,
    pub table: Option<String>,
    pub metric: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub links: Vec<LinkConfig>,
    pub local: Option<LocalConfig>,
    pub routes: Vec<RouteConfig>,
}

/// Factor stored as a fixed-point integer (thousandths) so `LinkConfig` can
/// derive `Eq`; the dispatcher divides back down to a float weight.
pub const FACTOR_SCALE: f64 = 1000.0;

pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse(&text).with_context(|| format!("while parsing {}", path.display()))
}

pub fn parse(text: &str) -> Result<Config> {
    let mut config = Config::default();
    let mut seen_names: HashSet<String> = HashSet::new();

    for (lineno, raw_line) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = raw_line.trim_end();
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').map(|f| f.trim()).collect();
        let kind = fields[0].to_ascii_lowercase();

        match kind.as_str() {
            "link" => {
                let link = parse_link(&fields, lineno)?;
                if !seen_names.insert(link.name.clone()) {
                    bail!("line {}: duplicate link name {:?}", lineno, link.name);
                }
                config.links.push(link);
            }
            "local" => {
                if config.local.is_some() {
                    bail!("line {}: duplicate local record", lineno);
                }
                config.local = Some(parse_local(&fields, lineno)?);
            }
            "route" => {
                config.routes.push(parse_route(&fields, lineno)?);
            }
            other => bail!("line {}: unknown record kind {:?}", lineno, other),
        }
    }

    Ok(config)
}

fn field<'a>(fields: &[&'a str], idx: usize, lineno: usize, name: &str) -> Result<&'a str> {
    match fields.get(idx) {
        Some(v) if !v.is_empty() => Ok(*v),
        _ => bail!("line {}: missing required field {:?}", lineno, name),
    }
}

fn parse_link(fields: &[&str], lineno: usize) -> Result<LinkConfig> {
    let name = field(fields, 1, lineno, "name")?.to_string();
    let src = Source::parse(field(fields, 2, lineno, "src")?);
    let srcport: u16 = field(fields, 3, lineno, "srcport")?
        .parse()
        .with_context(|| format!("line {}: srcport is not a valid port", lineno))?;
    let dstip = fields.get(4).filter(|s| !s.is_empty()).map(|s| s.to_string());
    let dstport = match fields.get(5).filter(|s| !s.is_empty()) {
        Some(s) => Some(
            s.parse::<u16>()
                .with_context(|| format!("line {}: dstport is not a valid port", lineno))?,
        ),
        None => None,
    };
    let factor_field = field(fields, 6, lineno, "factor")?;
    let factor_f: f64 = factor_field
        .parse()
        .with_context(|| format!("line {}: factor is not a number", lineno))?;
    if factor_f <= 0.0 {
        bail!("line {}: factor must be positive, got {}", lineno, factor_f);
    }
    let factor = (factor_f * FACTOR_SCALE).round() as u32;
    let options = LinkOptions::parse(fields.get(7).copied());

    Ok(LinkConfig {
        name,
        src,
        srcport,
        dstip,
        dstport,
        factor,
        options,
    })
}

fn parse_local(fields: &[&str], lineno: usize) -> Result<LocalConfig> {
    let ip = field(fields, 1, lineno, "ip")?.to_string();
    let mask = match fields.get(2).filter(|s| !s.is_empty()) {
        Some(s) => s
            .parse()
            .with_context(|| format!("line {}: mask is not a valid prefix length", lineno))?,
        None => 24,
    };
    let mtu = match fields.get(3).filter(|s| !s.is_empty()) {
        Some(s) => s
            .parse()
            .with_context(|| format!("line {}: mtu is not a number", lineno))?,
        None => 1300,
    };
    let dstip = fields.get(4).filter(|s| !s.is_empty()).map(|s| s.to_string());
    let options = LocalOptions::parse(fields.get(5).copied());

    Ok(LocalConfig {
        ip,
        mask,
        mtu,
        dstip,
        options,
    })
}

fn parse_route(fields: &[&str], lineno: usize) -> Result<RouteConfig> {
    let to = field(fields, 1, lineno, "to")?.to_string();
    let mask = field(fields, 2, lineno, "mask")?
        .parse()
        .with_context(|| format!("line {}: mask is not a valid prefix length", lineno))?;
    let gw = field(fields, 3, lineno, "gw")?.to_string();
    let table = fields.get(4).filter(|s| !s.is_empty()).map(|s| s.to_string());
    let metric = match fields.get(5).filter(|s| !s.is_empty()) {
        Some(s) => Some(
            s.parse()
                .with_context(|| format!("line {}: metric is not a number", lineno))?,
        ),
        None => None,
    };

    Ok(RouteConfig {
        to,
        mask,
        gw,
        table,
        metric,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_links_and_a_route() {
        let text = "\
# comment line, then blank line

link\teth0\teth0\t10\t203.0.113.1\t41000\t1\tbind,reuse
link\tlte\tlte0\t10\t203.0.113.1\t41001\t3
local\t10.1.0.1\t24\t1400
route\t0.0.0.0\t0\t10.1.0.254
";
        let config = parse(text).unwrap();
        assert_eq!(config.links.len(), 2);
        assert_eq!(config.links[0].name, "eth0");
        assert_eq!(config.links[0].src, Source::Interface("eth0".to_string()));
        assert_eq!(config.links[0].srcport, 10);
        assert_eq!(config.links[0].dstport, Some(41000));
        assert!(config.links[0].options.bind);
        assert!(config.links[0].options.reuse);
        assert_eq!(config.links[1].factor, 3000);
        assert_eq!(config.local.as_ref().unwrap().mtu, 1400);
        assert_eq!(config.routes.len(), 1);
    }

    #[test]
    fn local_defaults_apply() {
        let text = "local\t10.1.0.1\n";
        let config = parse(text).unwrap();
        let local = config.local.unwrap();
        assert_eq!(local.mask, 24);
        assert_eq!(local.mtu, 1300);
    }

    #[test]
    fn literal_src_is_not_an_interface() {
        let text = "link\tfixed\t203.0.113.9\t9000\t\t\t1\n";
        let config = parse(text).unwrap();
        assert_eq!(
            config.links[0].src,
            Source::Literal("203.0.113.9".to_string())
        );
        assert_eq!(config.links[0].dstip, None);
    }

    #[test]
    fn unknown_record_kind_is_fatal() {
        let err = parse("bogus\tfoo\tbar\n").unwrap_err();
        assert!(err.to_string().contains("unknown record kind"));
    }

    #[test]
    fn non_numeric_factor_is_fatal() {
        let err = parse("link\ta\teth0\t10\t\t\tnotanumber\n").unwrap_err();
        assert!(format!("{err:#}").contains("factor"));
    }

    #[test]
    fn zero_factor_is_fatal() {
        let err = parse("link\ta\teth0\t10\t\t\t0\n").unwrap_err();
        assert!(err.to_string().contains("factor must be positive"));
    }

    #[test]
    fn duplicate_link_name_is_fatal() {
        let text = "\
link\ta\teth0\t10\t\t\t1
link\ta\teth1\t11\t\t\t1
";
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate link name"));
    }
}
