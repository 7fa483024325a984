use anyhow::{bail, Context, Result};

use crate::types::Protocol;

/// Well-known ports covered by the common-port preset.
pub const COMMON_PORTS: &[u16] = &[21, 22, 23, 25, 53, 80, 110, 143, 443, 3389, 3306, 8080];

/// Parse a CLI port selection into an inclusive `(start, end)` pair.
///
/// Supported formats:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let s = s.trim();
    if let Some((a, b)) = s.split_once('-') {
        let start = parse_port_str(a.trim())
            .with_context(|| format!("invalid start in range: {a}"))?;
        let end = parse_port_str(b.trim())
            .with_context(|| format!("invalid end in range: {b}"))?;
        if start > end {
            bail!("invalid range {start}-{end} (start > end)");
        }
        return Ok((start, end));
    }
    let p = parse_port_str(s).with_context(|| format!("invalid port value: {s}"))?;
    Ok((p, p))
}

/// Conventional service name for a port, or `Unknown`.
pub fn service_name(port: u16, protocol: Protocol) -> String {
    lookup_service(port, protocol).unwrap_or("Unknown").to_string()
}

fn lookup_service(port: u16, protocol: Protocol) -> Option<&'static str> {
    use Protocol::*;
    let name = match (port, protocol) {
        (7, _) => "echo",
        (9, _) => "discard",
        (13, _) => "daytime",
        (20, Tcp) => "ftp-data",
        (21, Tcp) => "ftp",
        (22, _) => "ssh",
        (23, Tcp) => "telnet",
        (25, Tcp) => "smtp",
        (37, _) => "time",
        (43, Tcp) => "whois",
        (53, _) => "domain",
        (67, Udp) => "bootps",
        (68, Udp) => "bootpc",
        (69, Udp) => "tftp",
        (79, Tcp) => "finger",
        (80, _) => "http",
        (88, _) => "kerberos",
        (110, Tcp) => "pop3",
        (111, _) => "sunrpc",
        (119, Tcp) => "nntp",
        (123, _) => "ntp",
        (135, _) => "epmap",
        (137, _) => "netbios-ns",
        (138, _) => "netbios-dgm",
        (139, _) => "netbios-ssn",
        (143, Tcp) => "imap2",
        (161, _) => "snmp",
        (162, _) => "snmp-trap",
        (179, Tcp) => "bgp",
        (389, _) => "ldap",
        (443, _) => "https",
        (445, Tcp) => "microsoft-ds",
        (465, Tcp) => "submissions",
        (500, Udp) => "isakmp",
        (514, Tcp) => "shell",
        (514, Udp) => "syslog",
        (515, Tcp) => "printer",
        (520, Udp) => "route",
        (587, Tcp) => "submission",
        (631, _) => "ipp",
        (636, Tcp) => "ldaps",
        (873, Tcp) => "rsync",
        (993, Tcp) => "imaps",
        (995, Tcp) => "pop3s",
        (1194, _) => "openvpn",
        (1433, Tcp) => "ms-sql-s",
        (1434, _) => "ms-sql-m",
        (1521, Tcp) => "oracle",
        (1701, Udp) => "l2tp",
        (1723, Tcp) => "pptp",
        (1812, Udp) => "radius",
        (1883, Tcp) => "mqtt",
        (1900, Udp) => "ssdp",
        (2049, _) => "nfs",
        (2375, Tcp) => "docker",
        (3306, Tcp) => "mysql",
        (3389, Tcp) => "ms-wbt-server",
        (4500, Udp) => "ipsec-nat-t",
        (5060, _) => "sip",
        (5353, Udp) => "mdns",
        (5432, Tcp) => "postgresql",
        (5672, Tcp) => "amqp",
        (5900, Tcp) => "vnc",
        (6379, Tcp) => "redis",
        (6667, Tcp) => "ircd",
        (8080, Tcp) => "http-alt",
        (8443, Tcp) => "https-alt",
        (9092, Tcp) => "kafka",
        (9200, Tcp) => "elasticsearch",
        (11211, _) => "memcache",
        (27017, Tcp) => "mongodb",
        _ => return None,
    };
    Some(name)
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
