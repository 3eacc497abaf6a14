//! Read-only query handles
//!
//! A [`Session`] loads the per-owner complete histories on first use and
//! keeps its own reference to them, so repeated queries are consistent
//! with each other and never observe a half-applied poll. Network-level
//! queries read the service's identity-level history afresh each time.

use std::{ops::Range, sync::Arc};

use tracing::debug;

use super::{Error, PollFlags, Service};
use crate::{
    collection::{Collection, OwnerFilter},
    history::{Fields, History},
    platform::{Caller, Permission},
    stats::{CounterSet, Entry, NetworkStats, SYSTEM_UID, TAG_NONE, Tag, UID_ALL, Uid},
    template::NetworkTemplate,
};

/// How much of the accounting data a caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    /// Own data and the pseudo-owners only
    Owner,
    /// As [`AccessLevel::Owner`], plus device-wide summaries
    DeviceSummary,
    /// Everything
    Device,
}

impl Service {
    /// Resolve what `caller` may see.
    #[must_use]
    pub fn access_level(&self, caller: &Caller) -> AccessLevel {
        let permissions = self.platform.permissions.as_ref();
        if crate::stats::app_id(caller.uid) == SYSTEM_UID
            || permissions.is_device_or_profile_owner(caller)
        {
            AccessLevel::Device
        } else if permissions.has_usage_access(caller)
            || permissions.has_permission(caller, Permission::ReadNetworkUsageHistory)
        {
            AccessLevel::DeviceSummary
        } else {
            AccessLevel::Owner
        }
    }

    /// Open a query handle for `caller`.
    ///
    /// # Errors
    ///
    /// Fails with bandwidth accounting off.
    pub fn open_session(&self, caller: Caller) -> Result<Session<'_>, Error> {
        self.require_bandwidth_control()?;
        debug!(caller = caller.uid, package = ?caller.package, "opening session");
        Ok(Session {
            service: self,
            caller,
            uid_complete: None,
            uid_tag_complete: None,
        })
    }

    /// Poll every recorder, then open a query handle, so the session starts
    /// from current data.
    ///
    /// # Errors
    ///
    /// As [`Service::open_session`].
    pub fn open_session_for_usage_stats(&self, caller: Caller) -> Result<Session<'_>, Error> {
        self.require_bandwidth_control()?;
        self.perform_poll(PollFlags::ALL);
        self.open_session(caller)
    }
}

/// A query handle borrowed from a [`Service`].
#[derive(Debug)]
pub struct Session<'a> {
    service: &'a Service,
    caller: Caller,
    uid_complete: Option<Arc<Collection>>,
    uid_tag_complete: Option<Arc<Collection>>,
}

impl Session<'_> {
    /// The identity queries run as. Device-level callers see everything, so
    /// they run as the system.
    fn viewer(&self) -> Uid {
        match self.service.access_level(&self.caller) {
            AccessLevel::Device => SYSTEM_UID,
            AccessLevel::DeviceSummary | AccessLevel::Owner => self.caller.uid,
        }
    }

    /// Fail unless the caller has usage access or may read usage history.
    /// With `managed_admin`, device and profile owners pass as well.
    fn enforce(&self, managed_admin: bool) -> Result<(), Error> {
        let permissions = self.service.platform.permissions.as_ref();
        let allowed = permissions.has_usage_access(&self.caller)
            || (managed_admin && permissions.is_device_or_profile_owner(&self.caller))
            || crate::stats::app_id(self.caller.uid) == SYSTEM_UID
            || permissions.has_permission(&self.caller, Permission::ReadNetworkUsageHistory);
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                permission: Permission::ReadNetworkUsageHistory,
            })
        }
    }

    fn owner_complete(&mut self, tagged: bool) -> Result<Arc<Collection>, Error> {
        let slot = if tagged {
            &mut self.uid_tag_complete
        } else {
            &mut self.uid_complete
        };
        if let Some(complete) = slot {
            return Ok(Arc::clone(complete));
        }
        let complete = self.service.owner_complete(tagged)?;
        *slot = Some(Arc::clone(&complete));
        Ok(complete)
    }

    /// Owners with recorded history that this caller may see
    ///
    /// # Errors
    ///
    /// Fails without permission to read usage history, or if history cannot
    /// be loaded.
    pub fn get_relevant_owners(&mut self) -> Result<Vec<Uid>, Error> {
        self.enforce(true)?;
        let viewer = self.viewer();
        Ok(self.owner_complete(false)?.get_relevant_owners(viewer))
    }

    /// Every network matching `template` over `range`, collapsed into a
    /// single row.
    ///
    /// # Errors
    ///
    /// Fails without permission to read usage history.
    pub fn get_device_summary_for_network(
        &self,
        template: &NetworkTemplate,
        range: Range<i64>,
    ) -> Result<NetworkStats, Error> {
        self.enforce(false)?;
        let xt = self.service.xt_complete()?;
        let total = xt
            .get_summary(template, range.clone(), self.service.now(), SYSTEM_UID)
            .total();
        let elapsed = u64::try_from(range.end.saturating_sub(range.start)).unwrap_or(0);
        let mut result = NetworkStats::new(elapsed);
        result.combine_values(
            Entry::new(None, UID_ALL, CounterSet::All, TAG_NONE).with_counters(total),
        );
        Ok(result)
    }

    /// Network-level summary of networks matching `template` over `range`.
    ///
    /// # Errors
    ///
    /// Fails without permission to read usage history, or if history cannot
    /// be loaded.
    pub fn get_summary_for_network(
        &self,
        template: &NetworkTemplate,
        range: Range<i64>,
    ) -> Result<NetworkStats, Error> {
        self.enforce(false)?;
        let xt = self.service.xt_complete()?;
        Ok(xt.get_summary(template, range, self.service.now(), self.viewer()))
    }

    /// Network-level history of networks matching `template`.
    ///
    /// # Errors
    ///
    /// Fails if history cannot be loaded.
    pub fn get_history_for_network(
        &self,
        template: &NetworkTemplate,
        fields: Fields,
    ) -> Result<History, Error> {
        let xt = self.service.xt_complete()?;
        Ok(xt.get_history(
            template,
            OwnerFilter::network(),
            fields,
            i64::MIN..i64::MAX,
            self.viewer(),
        )?)
    }

    /// One row per visible (owner, set, tag) over `range`. Tagged rows are
    /// included only when `include_tags`.
    ///
    /// # Errors
    ///
    /// Fails without permission to read usage history, or if history cannot
    /// be loaded.
    pub fn get_summary_for_all_owners(
        &mut self,
        template: &NetworkTemplate,
        range: Range<i64>,
        include_tags: bool,
    ) -> Result<NetworkStats, Error> {
        self.enforce(true)?;
        let viewer = self.viewer();
        let now = self.service.now();
        let mut stats = self
            .owner_complete(false)?
            .get_summary(template, range.clone(), now, viewer);
        if include_tags {
            let tagged = self
                .owner_complete(true)?
                .get_summary(template, range, now, viewer);
            stats.combine_all(&tagged);
        }
        Ok(stats)
    }

    /// History of one owner, set and tag on networks matching `template`,
    /// restricted to `range` when given.
    ///
    /// # Errors
    ///
    /// Fails without permission to read usage history. Returns
    /// [`Error::AccessDenied`] if the caller may not see `owner`.
    pub fn get_history_for_owner(
        &mut self,
        template: &NetworkTemplate,
        owner: Uid,
        set: CounterSet,
        tag: Tag,
        fields: Fields,
        range: Option<Range<i64>>,
    ) -> Result<History, Error> {
        self.enforce(true)?;
        let viewer = self.viewer();
        let complete = self.owner_complete(tag != TAG_NONE)?;
        let filter = OwnerFilter {
            uid: owner,
            set,
            tag,
        };
        let range = range.unwrap_or(i64::MIN..i64::MAX);
        Ok(complete.get_history(template, filter, fields, range, viewer)?)
    }

    /// Release the cached histories
    pub fn close(self) {
        debug!(caller = self.caller.uid, "closing session");
    }
}
