//! Query builder

use rowstore::Value;

use crate::entity::EntityHandle;
use crate::error::{Error, Result};
use crate::session::Session;

/// A query bound to a session
///
/// ```ignore
/// let post = session
///     .create_query("select p from Post p join fetch p.details where p.id = :id")
///     .set_parameter("id", 1)
///     .set_cacheable(true)
///     .unique_result()?;
/// ```
pub struct Query<'s> {
    session: &'s mut Session,
    text: String,
    parameters: Vec<(String, Value)>,
    cacheable: bool,
}

impl<'s> Query<'s> {
    pub(crate) fn new(session: &'s mut Session, text: &str) -> Self {
        Self {
            session,
            text: text.to_string(),
            parameters: Vec::new(),
            cacheable: false,
        }
    }

    /// Bind a named parameter, replacing an earlier binding
    pub fn set_parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.parameters.iter_mut().find(|(n, _)| n == name) {
            Some(binding) => binding.1 = value,
            None => self.parameters.push((name.to_string(), value)),
        }
        self
    }

    /// Opt into the query cache
    pub fn set_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// All selected entities
    pub fn list(self) -> Result<Vec<EntityHandle>> {
        self.session
            .execute_query(&self.text, &self.parameters, self.cacheable)
    }

    /// The single selected entity, if any
    pub fn unique_result(self) -> Result<Option<EntityHandle>> {
        let mut results = self.list()?;
        match results.len() {
            0 | 1 => Ok(results.pop()),
            n => Err(Error::NonUniqueResult(n)),
        }
    }
}
