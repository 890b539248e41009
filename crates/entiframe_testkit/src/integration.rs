//! Cross-crate integration test helpers.
//!
//! [`IntegrationHarness`] drives a customers-model session against either
//! store kind while recording what the store should hold afterwards, then
//! checks it with a fresh no-tracking query.

use crate::fixtures::{customers_model, DocumentFixture, RelationalFixture};
use entiframe_core::{EntryId, Session, StoreKind, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExpectedCustomer {
    name: String,
    city: String,
}

/// A test harness for save/query round trips over the customers model.
pub struct IntegrationHarness {
    session: Session,
    entries: BTreeMap<String, EntryId>,
    pending: BTreeMap<String, Option<ExpectedCustomer>>,
    saved: BTreeMap<String, ExpectedCustomer>,
}

impl IntegrationHarness {
    /// Creates a harness over a fresh in-memory store of `kind`.
    pub fn new(kind: StoreKind) -> Self {
        let model = customers_model(kind);
        let session = match kind {
            StoreKind::Document => DocumentFixture::new(model).session,
            StoreKind::Relational => RelationalFixture::new(model).session,
        };
        Self {
            session,
            entries: BTreeMap::new(),
            pending: BTreeMap::new(),
            saved: BTreeMap::new(),
        }
    }

    /// The session under test.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Adds a customer with an address.
    pub fn add_customer(&mut self, id: &str, name: &str, city: &str) {
        let entry = crate::fixtures::add_customer(&self.session, id, name, city);
        self.entries.insert(id.to_string(), entry);
        self.pending.insert(
            id.to_string(),
            Some(ExpectedCustomer {
                name: name.to_string(),
                city: city.to_string(),
            }),
        );
    }

    /// Renames a tracked customer.
    pub fn rename(&mut self, id: &str, name: &str) {
        let entry = self.entry(id);
        self.session
            .set_value(entry, "Name", name)
            .expect("Failed to rename customer");
        if let Some(expected) = self.expected_mut(id) {
            expected.name = name.to_string();
        }
    }

    /// Changes the city on a tracked customer's address.
    pub fn relocate(&mut self, id: &str, city: &str) {
        let entry = self.entry(id);
        let address = self
            .session
            .instance(entry)
            .expect("Failed to read customer")
            .owned_one("Address")
            .and_then(|address| address.entry)
            .expect("customer has a tracked address");
        self.session
            .set_value(address, "City", city)
            .expect("Failed to relocate customer");
        if let Some(expected) = self.expected_mut(id) {
            expected.city = city.to_string();
        }
    }

    /// Removes a tracked customer and its address.
    pub fn remove(&mut self, id: &str) {
        let entry = self.entry(id);
        self.session.remove(entry).expect("Failed to remove customer");
        self.entries.remove(id);
        self.pending.insert(id.to_string(), None);
    }

    /// Saves pending changes and returns the number of entries written.
    pub fn save(&mut self) -> usize {
        let saved = self.session.save_changes().expect("Failed to save changes");
        for (id, expected) in std::mem::take(&mut self.pending) {
            match expected {
                Some(expected) => {
                    self.saved.insert(id, expected);
                }
                None => {
                    self.saved.remove(&id);
                }
            }
        }
        saved
    }

    /// Asserts the store holds exactly the saved customers.
    pub fn verify(&self) {
        let query = self
            .session
            .query("Customer")
            .expect("Failed to start query")
            .as_no_tracking();
        let mut actual = BTreeMap::new();
        for customer in self.session.to_list(&query).expect("Failed to run query") {
            let text = |value: Option<&Value>| value.and_then(Value::as_text).unwrap_or_default().to_string();
            let id = text(customer.get("Id"));
            let city = text(customer.owned_one("Address").and_then(|a| a.get("City")));
            actual.insert(
                id,
                ExpectedCustomer {
                    name: text(customer.get("Name")),
                    city,
                },
            );
        }
        assert_eq!(actual, self.saved, "stored customers differ from what was saved");
    }

    /// Number of customers the store should hold.
    pub fn saved_count(&self) -> usize {
        self.saved.len()
    }

    fn entry(&self, id: &str) -> EntryId {
        *self
            .entries
            .get(id)
            .unwrap_or_else(|| panic!("customer {id} is not tracked by the harness"))
    }

    fn expected_mut(&mut self, id: &str) -> Option<&mut ExpectedCustomer> {
        if !self.pending.contains_key(id) {
            let saved = self.saved.get(id).cloned();
            self.pending.insert(id.to_string(), saved);
        }
        self.pending.get_mut(id).and_then(Option::as_mut)
    }
}
