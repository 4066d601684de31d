use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use svclb_common::{Backend4Key, Backend4Value, BackendId, Service4Key, Service4Value};
use tabled::Tabled;
use tabled::settings::Style;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRow {
    pub address: Ipv4Addr,
    pub port: u16,
    pub count: Option<u16>,
    pub rev_nat: u16,
    /// (slot, backend id) pairs in slot order.
    pub slots: Vec<(u16, BackendId)>,
}

impl Tabled for ServiceRow {
    const LENGTH: usize = 4;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let count = match self.count {
            Some(count) => count.to_string(),
            None => "-".into(),
        };
        let mut slots = String::new();
        for (slot, id) in &self.slots {
            // slots the master no longer covers are left over from a scale down
            let stale = self.count.is_none_or(|count| *slot >= count);
            slots.push_str(&format!(
                "{slot} -> {id}{}\n",
                if stale { " (stale)" } else { "" }
            ));
        }
        vec![
            Cow::Owned(format!("{}:{}", self.address, self.port)),
            Cow::Owned(count),
            Cow::Owned(self.rev_nat.to_string()),
            Cow::Owned(slots),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec![
            Cow::Borrowed("SERVICE"),
            Cow::Borrowed("COUNT"),
            Cow::Borrowed("REV_NAT"),
            Cow::Borrowed("SLOTS"),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRow {
    pub id: BackendId,
    pub value: Backend4Value,
}

impl Tabled for BackendRow {
    const LENGTH: usize = 3;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let protocol = match self.value.protocol() {
            Some(protocol) => protocol.to_string(),
            None => "ANY".into(),
        };
        vec![
            Cow::Owned(self.id.to_string()),
            Cow::Owned(format!("{}:{}", self.value.ip(), self.value.port())),
            Cow::Owned(protocol),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec![
            Cow::Borrowed("ID"),
            Cow::Borrowed("BACKEND"),
            Cow::Borrowed("PROTOCOL"),
        ]
    }
}

/// Groups raw service entries by (address, port).
pub fn service_rows<'a, I>(entries: I) -> Vec<ServiceRow>
where
    I: IntoIterator<Item = (&'a Service4Key, &'a Service4Value)>,
{
    let mut rows: BTreeMap<(Ipv4Addr, u16), ServiceRow> = BTreeMap::new();
    for (key, value) in entries {
        let row = rows
            .entry((key.ip(), key.port()))
            .or_insert_with(|| ServiceRow {
                address: key.ip(),
                port: key.port(),
                count: None,
                rev_nat: value.rev_nat,
                slots: Vec::new(),
            });
        if key.is_master() {
            row.count = Some(value.count);
            row.rev_nat = value.rev_nat;
        } else {
            row.slots.push((key.backend_slot, value.backend_id));
        }
    }
    rows.into_values()
        .map(|mut row| {
            row.slots.sort_unstable();
            row
        })
        .collect()
}

pub fn backend_rows<'a, I>(entries: I) -> Vec<BackendRow>
where
    I: IntoIterator<Item = (&'a Backend4Key, &'a Backend4Value)>,
{
    let mut rows: Vec<BackendRow> = entries
        .into_iter()
        .map(|(key, value)| BackendRow {
            id: key.id,
            value: *value,
        })
        .collect();
    rows.sort_unstable_by_key(|row| row.id);
    rows
}

pub fn render<T: Tabled>(rows: Vec<T>) -> String {
    tabled::Table::new(rows).with(Style::modern()).to_string()
}
