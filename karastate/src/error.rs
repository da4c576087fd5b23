use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Deux clés typées partagent le même nom avec des types différents.
    #[error("cache key '{0}' already holds a value of another type")]
    TypeMismatch(&'static str),
}
