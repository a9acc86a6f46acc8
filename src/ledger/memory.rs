use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{check_transition, Ledger, LogEntry, LogStatus, NewLogEntry, Vehicle};
use crate::error::IngestError;

/// Ledger kept in process memory. Single writer only.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    entries: Vec<LogEntry>,
    vehicles: BTreeMap<String, Vehicle>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut LogEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| IngestError::UnknownEntry(id.to_string()).into())
    }
}

impl Ledger for InMemoryLedger {
    fn find_by_hash(&mut self, hash: &str, unit_number: &str) -> Result<Option<LogEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| {
                entry.unit_number == unit_number && entry.content_hash.as_deref() == Some(hash)
            })
            .min_by_key(|entry| entry.sequence)
            .cloned())
    }

    fn create_with_id(&mut self, id: &str, entry: NewLogEntry<'_>) -> Result<LogEntry> {
        if self.entries.iter().any(|existing| existing.id == id) {
            return Err(IngestError::AlreadyAccepted(id.to_string()).into());
        }
        let sequence = self
            .entries
            .iter()
            .filter(|existing| existing.unit_number == entry.unit_number)
            .map(|existing| existing.sequence)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| anyhow!("sequence space exhausted for {}", entry.unit_number))?;
        let created = LogEntry {
            id: id.to_string(),
            unit_number: entry.unit_number.to_string(),
            sequence,
            start_time: entry.start_time,
            end_time: None,
            length_secs: None,
            samples: None,
            content_hash: entry.content_hash.map(str::to_string),
            status: entry.status,
            original_file_name: entry.original_file_name.to_string(),
            upload_time: Utc::now(),
        };
        self.entries.push(created.clone());
        Ok(created)
    }

    fn update_status(&mut self, id: &str, status: LogStatus) -> Result<()> {
        let entry = self.entry_mut(id)?;
        check_transition(id, entry.status, status)?;
        entry.status = status;
        Ok(())
    }

    fn update_length(&mut self, id: &str, length_secs: f64, samples: u64) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.length_secs = Some(length_secs);
        entry.samples = Some(samples);
        Ok(())
    }

    fn update_end_time(&mut self, id: &str, end_time: DateTime<Utc>) -> Result<()> {
        self.entry_mut(id)?.end_time = Some(end_time);
        Ok(())
    }

    fn get(&mut self, id: &str) -> Result<Option<LogEntry>> {
        Ok(self.entries.iter().find(|entry| entry.id == id).cloned())
    }

    fn find_by_original_name(
        &mut self,
        unit_number: Option<&str>,
        original_file_name: &str,
    ) -> Result<Option<LogEntry>> {
        Ok(self
            .entries
            .iter()
            .rev()
            .find(|entry| {
                entry.original_file_name == original_file_name
                    && unit_number.map_or(true, |unit| entry.unit_number == unit)
            })
            .cloned())
    }

    fn bind_content(&mut self, id: &str, start_time: DateTime<Utc>, hash: &str) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.start_time = start_time;
        entry.content_hash = Some(hash.to_string());
        Ok(())
    }

    fn entries_for_unit(&mut self, unit_number: &str) -> Result<Vec<LogEntry>> {
        let mut entries: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.unit_number == unit_number)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.sequence);
        Ok(entries)
    }

    fn entries_with_status(&mut self, status: LogStatus) -> Result<Vec<LogEntry>> {
        let mut entries: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.status == status)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.unit_number
                .cmp(&b.unit_number)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(entries)
    }

    fn ensure_vehicle(&mut self, unit_number: &str, vehicle_type: &str) -> Result<Vehicle> {
        Ok(self
            .vehicles
            .entry(unit_number.to_string())
            .or_insert_with(|| Vehicle {
                unit_number: unit_number.to_string(),
                vehicle_type: vehicle_type.to_string(),
                serial_number: None,
                status: None,
            })
            .clone())
    }

    fn vehicle(&mut self, unit_number: &str) -> Result<Option<Vehicle>> {
        Ok(self.vehicles.get(unit_number).cloned())
    }
}
