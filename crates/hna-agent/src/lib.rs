// hna-agent: the three independent reconciliation pipelines and the
// in-guest metadata query client.

pub mod imds;
pub mod loops;
