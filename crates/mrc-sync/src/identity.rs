use std::collections::HashMap;

use mrc_adapters::MasterRow;
use mrc_core::LinkToken;
use uuid::Uuid;

/// Point-in-time lookup of master rows by identity and by back-reference.
#[derive(Debug, Default, Clone)]
pub struct IdentityIndex {
    by_uuid: HashMap<Uuid, usize>,
    by_token: HashMap<String, Vec<usize>>,
}

impl IdentityIndex {
    pub fn build(rows: &[MasterRow]) -> Self {
        let mut index = Self::default();
        for row in rows {
            index.insert(row.record.master_uuid, row.record.link_token.as_ref(), row.row);
        }
        index
    }

    pub fn assign() -> Uuid {
        Uuid::new_v4()
    }

    pub fn insert(&mut self, uuid: Uuid, token: Option<&LinkToken>, row: usize) {
        self.by_uuid.entry(uuid).or_insert(row);
        if let Some(token) = token {
            let rows = self.by_token.entry(token.canonical()).or_default();
            if !rows.contains(&row) {
                rows.push(row);
            }
        }
    }

    pub fn find_master_row_by_uuid(&self, uuid: &Uuid) -> Option<usize> {
        self.by_uuid.get(uuid).copied()
    }

    /// Only an unambiguous match counts.
    pub fn find_master_row_by_link_token(&self, token: &LinkToken) -> Option<usize> {
        match self.by_token.get(&token.canonical()).map(Vec::as_slice) {
            Some([row]) => Some(*row),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrc_core::{CellValue, MasterRecord};

    fn row(row: usize, uuid: Uuid, token: Option<LinkToken>) -> MasterRow {
        MasterRow {
            row,
            record: MasterRecord {
                date: CellValue::Empty,
                test_type: String::new(),
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                dob: CellValue::Empty,
                zip: String::new(),
                source_id: "src".into(),
                link_token: token,
                sheet_name: "Lab".into(),
                file_name: "Clinic".into(),
                master_uuid: uuid,
                potential_duplicates: String::new(),
            },
            highlighted: false,
        }
    }

    #[test]
    fn lookups_by_uuid_and_token() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let index = IdentityIndex::build(&[
            row(2, a, Some(LinkToken::new("src", 0, 5))),
            row(3, b, Some(LinkToken::new("src", 0, 6))),
        ]);
        assert_eq!(index.find_master_row_by_uuid(&a), Some(2));
        assert_eq!(index.find_master_row_by_uuid(&Uuid::new_v4()), None);
        assert_eq!(
            index.find_master_row_by_link_token(&LinkToken::new("src", 0, 6)),
            Some(3)
        );
        let pasted = LinkToken::parse("https://docs.google.com/spreadsheets/d/src/edit?range=A6%253AH6&gid=0")
            .expect("row link");
        assert_eq!(index.find_master_row_by_link_token(&pasted), Some(3));
    }

    #[test]
    fn ambiguous_tokens_do_not_resolve() {
        let token = LinkToken::new("src", 0, 5);
        let index = IdentityIndex::build(&[
            row(2, Uuid::new_v4(), Some(token.clone())),
            row(3, Uuid::new_v4(), Some(token.clone())),
        ]);
        assert_eq!(index.find_master_row_by_link_token(&token), None);
    }

    #[test]
    fn assigned_uuids_are_fresh() {
        let mut index = IdentityIndex::default();
        let uuid = IdentityIndex::assign();
        assert_eq!(index.find_master_row_by_uuid(&uuid), None);
        index.insert(uuid, None, 9);
        assert_eq!(index.find_master_row_by_uuid(&uuid), Some(9));
        assert_ne!(IdentityIndex::assign(), uuid);
    }
}
