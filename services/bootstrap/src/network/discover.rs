//! Parsing of `ip` command output.

use std::net::Ipv4Addr;

/// Interface of the default route in `ip route show default` output.
///
/// `default via 10.0.0.1 dev eth0 proto dhcp metric 100` yields `eth0`.
pub fn parse_default_device(routes: &str) -> Option<String> {
    routes
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("default"))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            fields.find(|f| *f == "dev")?;
            fields.next().map(str::to_string)
        })
}

/// First IPv4 address in `ip -4 addr show dev <if>` output.
pub fn parse_ipv4(addrs: &str) -> Option<Ipv4Addr> {
    addrs
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("inet "))
        .find_map(|rest| {
            let cidr = rest.split_whitespace().next()?;
            let address = cidr.split('/').next()?;
            address.parse().ok()
        })
}
