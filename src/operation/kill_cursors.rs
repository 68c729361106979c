use bson::{doc, Bson, Document};

use crate::{
    channel::Command,
    error::{Error, ErrorKind, Result},
    operation::Operation,
    topology::ServerDescription,
    Namespace,
};

/// The operation a cursor issues to release its server side resources early.
///
/// Never carries a session id.
#[derive(Debug)]
pub struct KillCursors {
    ns: Namespace,
    cursor_ids: Vec<i64>,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_ids: Vec<i64>) -> Self {
        Self { ns, cursor_ids }
    }
}

impl Operation for KillCursors {
    type O = KillCursorsResult;

    fn name(&self) -> &str {
        "killCursors"
    }

    fn build(&mut self, _description: &ServerDescription) -> Result<Command> {
        let cursors: Vec<Bson> = self.cursor_ids.iter().map(|id| Bson::Int64(*id)).collect();
        let body = doc! {
            "killCursors": self.ns.coll.clone(),
            "cursors": cursors,
        };
        Ok(Command::new(self.name(), self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: Document) -> Result<Self::O> {
        let to_ids = |key: &str| -> Result<Vec<i64>> {
            match response.get_array(key) {
                Ok(values) => values
                    .iter()
                    .map(|v| {
                        v.as_i64().ok_or_else(|| {
                            Error::invalid_response(format!(
                                "expected integer cursor id in {}, instead got {:?}",
                                key, v
                            ))
                        })
                    })
                    .collect(),
                Err(_) => Ok(Vec::new()),
            }
        };
        let result = KillCursorsResult {
            cursors_killed: to_ids("cursorsKilled")?,
            cursors_not_found: to_ids("cursorsNotFound")?,
        };

        if let Some(id) = self
            .cursor_ids
            .iter()
            .find(|id| result.cursors_not_found.contains(id))
        {
            return Err(ErrorKind::CursorNotFound { cursor_id: *id }.into());
        }
        if let Some(id) = self
            .cursor_ids
            .iter()
            .find(|id| !result.cursors_killed.contains(id))
        {
            return Err(Error::invalid_response(format!(
                "killCursors did not report cursor {} as killed",
                id
            )));
        }
        Ok(result)
    }

    fn supports_sessions(&self) -> bool {
        false
    }
}

/// The contents of a `killCursors` reply.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct KillCursorsResult {
    /// The cursor ids the server reports as killed.
    pub cursors_killed: Vec<i64>,

    /// The cursor ids the server no longer knew about.
    pub cursors_not_found: Vec<i64>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::{test_util::server_description, ServerType};

    #[test]
    fn command_shape() {
        let mut op = KillCursors::new(Namespace::new("db", "coll"), vec![42]);
        let description = server_description("db0:27017", ServerType::RsPrimary);
        let cmd = op.build(&description).unwrap();
        assert_eq!(cmd.name, "killCursors");
        assert_eq!(
            cmd.body,
            doc! { "killCursors": "coll", "cursors": [42i64] }
        );
        assert!(!op.supports_sessions());
    }

    #[test]
    fn killed_cursor_is_reported() {
        let op = KillCursors::new(Namespace::new("db", "coll"), vec![42]);
        let result = op
            .handle_response(doc! {
                "ok": 1,
                "cursorsKilled": [42i64],
                "cursorsNotFound": [],
            })
            .unwrap();
        assert_eq!(result.cursors_killed, vec![42]);
    }

    #[test]
    fn unknown_cursor_is_an_error() {
        let op = KillCursors::new(Namespace::new("db", "coll"), vec![42]);
        let error = op
            .handle_response(doc! {
                "ok": 1,
                "cursorsKilled": [],
                "cursorsNotFound": [42i64],
            })
            .unwrap_err();
        assert!(error.is_cursor_not_found());
    }
}
