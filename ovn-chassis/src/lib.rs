pub mod agent;
pub mod exec;
pub mod iptables;
pub mod network;
pub mod ovsdb;
pub mod status;

#[cfg(test)]
pub mod testing;
