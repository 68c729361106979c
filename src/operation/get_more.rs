use std::{collections::VecDeque, time::Duration};

use bson::{doc, Bson, Document};

use crate::{
    channel::Command,
    error::{Error, Result},
    operation::{Operation, SERVER_4_4_0_WIRE_VERSION},
    topology::ServerDescription,
    Namespace,
};

/// The operation a cursor issues to fetch its next batch.
#[derive(Debug)]
pub struct GetMore {
    ns: Namespace,
    cursor_id: i64,
    batch_size: Option<i32>,
    max_time: Option<Duration>,
    comment: Option<Bson>,
}

impl GetMore {
    pub(crate) fn new(
        ns: Namespace,
        cursor_id: i64,
        batch_size: Option<i32>,
        max_time: Option<Duration>,
        comment: Option<Bson>,
    ) -> Self {
        Self {
            ns,
            cursor_id,
            batch_size,
            max_time,
            comment,
        }
    }
}

impl Operation for GetMore {
    type O = GetMoreResult;

    fn name(&self) -> &str {
        "getMore"
    }

    fn build(&mut self, description: &ServerDescription) -> Result<Command> {
        let mut body = doc! {
            "getMore": self.cursor_id,
            "collection": self.ns.coll.clone(),
        };

        if let Some(batch_size) = self.batch_size {
            if batch_size != 0 {
                body.insert("batchSize", batch_size);
            }
        }

        if let Some(ref max_time) = self.max_time {
            body.insert(
                "maxTimeMS",
                i32::try_from(max_time.as_millis()).unwrap_or(i32::MAX),
            );
        }

        if let Some(ref comment) = self.comment {
            if description.max_wire_version.unwrap_or(0) >= SERVER_4_4_0_WIRE_VERSION {
                body.insert("comment", comment.clone());
            }
        }

        Ok(Command::new(self.name(), self.ns.db.clone(), body))
    }

    fn handle_response(&self, response: Document) -> Result<Self::O> {
        let cursor = response.get_document("cursor")?;
        let id = cursor.get_i64("id")?;
        let batch = cursor
            .get_array("nextBatch")?
            .iter()
            .map(|value| match value {
                Bson::Document(doc) => Ok(doc.clone()),
                other => Err(Error::invalid_response(format!(
                    "expected document in nextBatch, instead got {:?}",
                    other
                ))),
            })
            .collect::<Result<VecDeque<Document>>>()?;

        Ok(GetMoreResult { id, batch })
    }
}

/// The contents of a `getMore` reply.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct GetMoreResult {
    /// The cursor id the server will honor on the next fetch; `0` means the cursor is
    /// exhausted.
    pub id: i64,

    /// The next batch of documents.
    pub batch: VecDeque<Document>,
}
