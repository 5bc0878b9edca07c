// hna-net: external command plumbing and kernel network state.
// Everything that shells out to ip/iptables/ipset lives here.

pub mod arp;
pub mod exec;
pub mod iproute;
pub mod ipset;
pub mod iptables;
pub mod naming;
pub mod qga;
