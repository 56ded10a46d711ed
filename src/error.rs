use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not determine this machine's client identity")]
    Identity,
    #[display("could not open a replica")]
    Storage,
    #[display("sync cycle failed")]
    Sync,
}
