use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::ResolveError;
use crate::models::{EventKind, NotificationEvent, UserId};
use crate::store::UserDirectory;

/// Maps an event to the users who should hear about it.
///
/// | event    | candidates                        |
/// |----------|-----------------------------------|
/// | new_post | every follower of the actor       |
/// | comment  | the post author                   |
/// | reply    | the parent comment author         |
/// | like     | the post author                   |
/// | follow   | the followed user                 |
///
/// The actor is always dropped, as is any candidate who explicitly opted
/// out of the event's category. Output order is unspecified.
pub struct RecipientResolver<D> {
    directory: Arc<D>,
}

impl<D> RecipientResolver<D>
where
    D: UserDirectory,
{
    pub fn new(directory: Arc<D>) -> Self {
        Self { directory }
    }

    pub async fn resolve(&self, event: &NotificationEvent) -> Result<Vec<UserId>, ResolveError> {
        let subject = event.validate()?;

        let candidates = match event.kind {
            EventKind::NewPost => self.directory.followers_of(&event.actor_id).await?,
            EventKind::Comment | EventKind::Reply | EventKind::Like | EventKind::Follow => {
                subject.owner_id.iter().cloned().collect()
            }
        };

        let mut seen = HashSet::with_capacity(candidates.len());
        let candidates: Vec<UserId> = candidates
            .into_iter()
            .filter(|id| *id != event.actor_id && seen.insert(id.clone()))
            .collect();

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let preferences = self.directory.preferences_for(&candidates).await?;
        let category = event.kind.category();
        let recipients: Vec<UserId> = candidates
            .into_iter()
            .filter(|id| preferences.get(id).map_or(true, |p| p.allows(category)))
            .collect();

        debug!(
            event_type = %event.kind,
            actor_id = %event.actor_id,
            recipients = recipients.len(),
            "Resolved recipients"
        );
        Ok(recipients)
    }
}
