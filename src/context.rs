//! Per-(target, template) execution state.

use crate::cancel::CancelSignal;
use crate::error::ExecError;
use crate::primitives::{interpolate, target_bindings, value_to_string};
use crate::types::{Extracted, ResultRecord, Template};
use tokio::sync::mpsc;

/// Ordered variable bindings: name → one or more values.
///
/// Placeholders resolve to the first value of a name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Variables {
    entries: Vec<(String, Vec<String>)>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to a single value, replacing any previous binding.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.set_all(name, vec![value.into()]);
    }

    /// Binds `name` to a list of values, replacing any previous binding.
    pub fn set_all(&mut self, name: &str, values: Vec<String>) {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some((_, existing)) => *existing = values,
            None => self.entries.push((name.to_string(), values)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binds every extracted name, replacing earlier bindings of the same name.
    pub fn merge(&mut self, extracted: &Extracted) {
        for entry in extracted.iter() {
            self.set_all(&entry.name, entry.values.clone());
        }
    }

    /// A copy of these bindings with `extracted` merged on top.
    pub fn overlay(&self, extracted: &Extracted) -> Variables {
        let mut out = self.clone();
        out.merge(extracted);
        out
    }

    /// Adds a template's own `variables`, interpolated in declaration order,
    /// skipping names that are already bound.
    pub fn seed_template(&mut self, template: &Template) -> Result<(), ExecError> {
        for (name, raw) in &template.variables {
            if self.contains(name) {
                continue;
            }
            let text = value_to_string(raw);
            let value = interpolate(&text, self).map_err(|e| {
                ExecError::config(format!(
                    "template '{}' variable '{}': {}",
                    template.id, name, e
                ))
            })?;
            self.set(name, value);
        }
        Ok(())
    }
}

/// Mutable state of one (target, template) run.
///
/// Owned exclusively by the run that created it; steps mutate it strictly in
/// sequence and it is dropped when the run completes.
#[derive(Debug)]
pub struct ExecutionContext {
    pub target: String,
    pub template_id: String,
    variables: Variables,
    records: Vec<ResultRecord>,
    forward: Option<mpsc::UnboundedSender<ResultRecord>>,
    cancel: CancelSignal,
    requests_sent: usize,
}

impl ExecutionContext {
    /// Seeds target bindings, then `globals`, then the template's variables.
    pub fn new(
        target: &str,
        template: &Template,
        globals: &Variables,
        cancel: CancelSignal,
    ) -> Result<Self, ExecError> {
        let mut variables = Variables::new();
        for (name, value) in target_bindings(target) {
            variables.set(&name, value);
        }
        for (name, values) in globals.iter() {
            variables.set_all(name, values.to_vec());
        }
        variables.seed_template(template)?;

        Ok(ExecutionContext {
            target: target.to_string(),
            template_id: template.id.clone(),
            variables,
            records: Vec::new(),
            forward: None,
            cancel,
            requests_sent: 0,
        })
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Makes extracted values visible to every later step of this run.
    pub fn merge(&mut self, extracted: &Extracted) {
        self.variables.merge(extracted);
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sends a copy of every record pushed from now on to `tx` as it happens.
    pub fn forward_records(&mut self, tx: mpsc::UnboundedSender<ResultRecord>) {
        self.forward = Some(tx);
    }

    pub fn push_record(&mut self, record: ResultRecord) {
        if let Some(tx) = &self.forward {
            // The receiver outlives every run of a scan.
            let _ = tx.send(record.clone());
        }
        self.records.push(record);
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    /// Ends the run, handing back its records in emission order.
    pub fn into_records(self) -> Vec<ResultRecord> {
        self.records
    }

    pub fn note_request(&mut self) {
        self.requests_sent += 1;
    }

    pub fn requests_sent(&self) -> usize {
        self.requests_sent
    }
}
