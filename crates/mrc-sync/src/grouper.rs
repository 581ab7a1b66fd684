use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use mrc_adapters::{DuplicateSummaryRow, MasterRow};
use mrc_core::{GroupKey, KeyBuilder, LogEntry, ReasonCode};
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};

use crate::error::{SyncError, SyncResult};
use crate::{Consolidator, RunOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupingSummary {
    /// Groups with at least two members.
    pub groups: usize,
    pub flagged_rows: usize,
    pub newly_notified_groups: usize,
    pub logged: usize,
    pub cleared_rows: usize,
}

/// Master rows bucketed by duplicate-group key, in row order. Rows missing a
/// first name, last name or date of birth are left out.
pub(crate) fn group_rows<'a>(rows: &'a [MasterRow], keys: &KeyBuilder) -> BTreeMap<GroupKey, Vec<&'a MasterRow>> {
    let mut groups: BTreeMap<GroupKey, Vec<&MasterRow>> = BTreeMap::new();
    for row in rows {
        let record = &row.record;
        if let Some(key) = keys.group_key(&record.first_name, &record.last_name, &record.dob) {
            groups.entry(key).or_default().push(row);
        }
    }
    groups
}

fn peer_labels(members: &[&MasterRow], own_row: usize) -> Vec<String> {
    members
        .iter()
        .filter(|peer| peer.row != own_row)
        .map(|peer| peer.record.label(peer.row))
        .collect()
}

impl Consolidator {
    /// Standalone grouping pass over the whole master table.
    pub async fn run_duplicate_pass(&self, triggered_by: &str) -> RunOutcome<GroupingSummary> {
        let result = self.try_duplicate_pass(triggered_by).await;
        self.conclude("duplicate_pass", triggered_by, result).await
    }

    async fn try_duplicate_pass(&self, triggered_by: &str) -> SyncResult<GroupingSummary> {
        let _lock = self.lock_master(self.config.batch_lock_wait).await?;
        let summary = self.group_duplicates(&self.key_builder(), triggered_by).await?;
        self.flush_tables().await?;
        Ok(summary)
    }

    /// Refreshes flags and notes on every member of every group, logs groups
    /// that were never reported, and clears stale flags. Caller holds the lock.
    pub(crate) async fn group_duplicates(&self, keys: &KeyBuilder, triggered_by: &str) -> SyncResult<GroupingSummary> {
        let span = info_span!("duplicate_pass", triggered_by);
        async {
            let rows = self.master.all_rows().await?;
            let groups = group_rows(&rows, keys);

            let mut summary = GroupingSummary::default();
            let mut flagged = HashSet::new();
            let mut summary_rows = Vec::new();

            for (key, members) in groups.iter().filter(|(_, m)| m.len() >= 2) {
                summary.groups += 1;
                for member in members {
                    let note = peer_labels(members, member.row).join(", ");
                    if member.record.potential_duplicates != note {
                        self.master.set_note(member.row, &note).await?;
                    }
                    if !member.highlighted {
                        self.master.set_highlight(member.row, true).await?;
                    }
                    flagged.insert(member.row);
                }
                summary.flagged_rows += members.len();

                if self.flags.notified_at(key).await?.is_none() {
                    let entries: Vec<LogEntry> = members
                        .iter()
                        .map(|member| {
                            let mut entry = LogEntry::new(ReasonCode::PotentialDuplicate)
                                .with_source(&member.record.source_id, &member.record.sheet_name)
                                .at_row(member.row)
                                .with_values(member.record.values())
                                .with_duplicates(peer_labels(members, member.row))
                                .triggered_by(triggered_by);
                            if let Some(token) = &member.record.link_token {
                                entry = entry.with_link(self.row_link(token));
                            }
                            entry
                        })
                        .collect();
                    self.log.write(&entries).await?;
                    self.flags.mark(key, Utc::now()).await?;
                    summary.logged += entries.len();
                    summary.newly_notified_groups += 1;
                    info!(group = %key, members = members.len(), "new duplicate group reported");
                } else {
                    debug!(group = %key, members = members.len(), "duplicate group already reported");
                }

                summary_rows.push(DuplicateSummaryRow {
                    first_name: key.first.clone(),
                    last_name: key.last.clone(),
                    dob: key.dob.clone(),
                    count: members.len(),
                    links: members
                        .iter()
                        .map(|m| match &m.record.link_token {
                            Some(token) => self.row_link(token),
                            None => m.record.label(m.row),
                        })
                        .collect(),
                });
            }

            for row in rows.iter().filter(|r| !flagged.contains(&r.row)) {
                if row.highlighted || !row.record.potential_duplicates.is_empty() {
                    self.master.set_note(row.row, "").await?;
                    self.master.set_highlight(row.row, false).await?;
                    summary.cleared_rows += 1;
                }
            }

            self.master.replace_duplicate_summary(summary_rows).await?;
            Ok::<_, SyncError>(summary)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mrc_core::{CellValue, DateContext, MasterRecord};
    use uuid::Uuid;

    fn row(row: usize, first: &str, dob: &str) -> MasterRow {
        MasterRow {
            row,
            record: MasterRecord {
                date: CellValue::from("2024-01-10"),
                test_type: String::new(),
                first_name: first.into(),
                last_name: "Doe".into(),
                dob: CellValue::from(dob),
                zip: String::new(),
                source_id: "src".into(),
                link_token: None,
                sheet_name: "Lab".into(),
                file_name: "Clinic".into(),
                master_uuid: Uuid::new_v4(),
                potential_duplicates: String::new(),
            },
            highlighted: false,
        }
    }

    #[test]
    fn rows_group_by_name_and_dob_only() {
        let keys = KeyBuilder::new(DateContext::utc_today(
            NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
        ));
        let rows = vec![
            row(2, "Jane", "1990-05-02"),
            row(3, "JANE ", "5/2/1990"),
            row(4, "Jayne", "1990-05-02"),
            row(5, "", "1990-05-02"),
            row(6, "Jane", ""),
        ];
        let groups = group_rows(&rows, &keys);
        assert_eq!(groups.len(), 2);
        let jane = groups
            .iter()
            .find(|(k, _)| k.first == "JANE")
            .map(|(_, v)| v.iter().map(|r| r.row).collect::<Vec<_>>())
            .expect("jane group");
        assert_eq!(jane, vec![2, 3]);
    }

    #[test]
    fn peers_exclude_the_member_itself() {
        let rows = [row(2, "Jane", "x"), row(3, "Jane", "x"), row(4, "Jane", "x")];
        let members: Vec<&MasterRow> = rows.iter().collect();
        assert_eq!(
            peer_labels(&members, 3),
            vec!["Clinic (Lab) Row 2".to_string(), "Clinic (Lab) Row 4".to_string()]
        );
    }
}
