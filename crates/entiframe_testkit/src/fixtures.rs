//! Fixture models and session helpers.
//!
//! Every model comes in a document and a relational flavour so the same
//! scenario can be run against both save pipelines.

use entiframe_core::metadata::EnumToStringConverter;
use entiframe_core::{
    Config, EntityTypeBuilder, EntryId, ForeignKeyBuilder, InMemoryDocumentStore,
    InMemoryRelationalStore, Model, ModelBuilder, PropertyBuilder, Session, Store, StoreKind,
    Value, ValueGenerated, ValueKind,
};
use std::fmt;
use std::sync::Arc;

/// Concrete animal types and their discriminator values.
pub const ANIMAL_KINDS: [&str; 2] = ["Dog", "Cat"];

fn builder(kind: StoreKind) -> ModelBuilder {
    ModelBuilder::new(kind)
}

fn root(name: &str, store_object: &str, kind: StoreKind) -> EntityTypeBuilder {
    let builder = EntityTypeBuilder::new(name);
    match kind {
        StoreKind::Document => builder.container(store_object),
        StoreKind::Relational => builder.table(store_object),
    }
}

/// An abstract `Animal` with concrete `Dog` and `Cat`, stored together in
/// `Animals` and told apart by discriminator.
pub fn animals_model(kind: StoreKind) -> Arc<Model> {
    builder(kind)
        .entity(
            root("Animal", "Animals", kind)
                .abstract_type()
                .property("Id", ValueKind::Text)
                .property("Name", ValueKind::Text)
                .key(["Id"]),
        )
        .entity(
            EntityTypeBuilder::new("Dog")
                .base("Animal")
                .property_with(PropertyBuilder::new("Breed", ValueKind::Text).nullable()),
        )
        .entity(
            EntityTypeBuilder::new("Cat")
                .base("Animal")
                .property_with(PropertyBuilder::new("Lives", ValueKind::Integer).nullable()),
        )
        .build()
        .expect("animal model is valid")
}

/// Customers owning one `Address`, and orders owning many `Lines`.
///
/// Document flavour: both roots carry an `_etag`. Relational flavour: an
/// order references its customer through a required `CustomerId` and carries
/// a `RowVersion` token; lines live in `OrderLines`.
pub fn customers_model(kind: StoreKind) -> Arc<Model> {
    let mut customer = root("Customer", "Customers", kind)
        .property("Id", ValueKind::Text)
        .property("Name", ValueKind::Text)
        .key(["Id"]);
    let mut order = root("Order", "Orders", kind)
        .property("Id", ValueKind::Text)
        .property("CustomerId", ValueKind::Text)
        .property("Status", ValueKind::Text)
        .key(["Id"]);
    match kind {
        StoreKind::Document => {
            customer = customer.etag();
            order = order.etag();
        }
        StoreKind::Relational => {
            order = order.property_with(
                PropertyBuilder::new("RowVersion", ValueKind::Bytes)
                    .nullable()
                    .concurrency_token()
                    .generated(ValueGenerated::OnAddOrUpdate),
            );
        }
    }

    let mut model = builder(kind)
        .entity(customer)
        .entity(order)
        .owns_one(
            "Customer",
            "Address",
            EntityTypeBuilder::new("Address")
                .property("Street", ValueKind::Text)
                .property("City", ValueKind::Text),
        )
        .owns_many(
            "Order",
            "Lines",
            EntityTypeBuilder::new("Line")
                .table("OrderLines")
                .property("Sku", ValueKind::Text)
                .property("Quantity", ValueKind::Integer),
        );
    if kind == StoreKind::Relational {
        model = model.foreign_key(
            ForeignKeyBuilder::new("Order", "Customer", ["CustomerId"])
                .dependent_navigation("Customer")
                .principal_navigation("Orders"),
        );
    }
    model.build().expect("customer model is valid")
}

/// Engine kinds, stored by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// Burns fuel.
    Combustion,
    /// Runs on a battery.
    Electric,
    /// Both.
    Hybrid,
}

impl EngineKind {
    /// Every engine kind, in ordinal order.
    pub const ALL: [EngineKind; 3] = [Self::Combustion, Self::Electric, Self::Hybrid];

    /// Member name, as stored.
    pub fn name(self) -> &'static str {
        match self {
            Self::Combustion => "Combustion",
            Self::Electric => "Electric",
            Self::Hybrid => "Hybrid",
        }
    }

    /// Entity-side value: the ordinal.
    pub fn ordinal(self) -> i64 {
        match self {
            Self::Combustion => 0,
            Self::Electric => 1,
            Self::Hybrid => 2,
        }
    }

    /// Reads an entity-side ordinal back.
    pub fn from_ordinal(value: &Value) -> Option<Self> {
        let ordinal = value.as_integer()?;
        Self::ALL.into_iter().find(|kind| kind.ordinal() == ordinal)
    }
}

/// The closed set of vehicle kinds.
///
/// Each kind becomes one concrete entity type; powered kinds share an
/// abstract `PoweredVehicle` base declaring the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VehicleKind {
    /// No engine.
    Bicycle,
    /// Powered, carries passengers.
    Car,
    /// Powered, carries a payload.
    Truck,
}

impl VehicleKind {
    /// Every vehicle kind.
    pub const ALL: [VehicleKind; 3] = [Self::Bicycle, Self::Car, Self::Truck];

    /// Entity type name, also the discriminator value.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Bicycle => "Bicycle",
            Self::Car => "Car",
            Self::Truck => "Truck",
        }
    }

    /// Whether the kind has an engine.
    pub fn is_powered(self) -> bool {
        !matches!(self, Self::Bicycle)
    }

    fn base(self) -> &'static str {
        if self.is_powered() {
            "PoweredVehicle"
        } else {
            "Vehicle"
        }
    }
}

impl fmt::Display for VehicleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Vehicles built from [`VehicleKind`], stored in `Vehicles`.
pub fn vehicles_model(kind: StoreKind) -> Arc<Model> {
    let engine_names = EngineKind::ALL.map(EngineKind::name);
    let mut model = builder(kind)
        .entity(
            root("Vehicle", "Vehicles", kind)
                .abstract_type()
                .property("Name", ValueKind::Text)
                .property("SeatingCapacity", ValueKind::Integer)
                .key(["Name"]),
        )
        .entity(
            EntityTypeBuilder::new("PoweredVehicle")
                .base("Vehicle")
                .abstract_type()
                .property_with(
                    PropertyBuilder::new("Engine", ValueKind::Integer)
                        .nullable()
                        .converter(Arc::new(EnumToStringConverter::new(engine_names))),
                ),
        );
    for vehicle in VehicleKind::ALL {
        let mut ty = EntityTypeBuilder::new(vehicle.type_name()).base(vehicle.base());
        if vehicle == VehicleKind::Truck {
            ty = ty.property_with(PropertyBuilder::new("Payload", ValueKind::Integer).nullable());
        }
        model = model.entity(ty);
    }
    model.build().expect("vehicle model is valid")
}

/// A session over a fresh in-memory document store.
pub struct DocumentFixture {
    /// The session under test.
    pub session: Session,
    /// The store, for inspecting what was written.
    pub store: Arc<InMemoryDocumentStore>,
}

impl DocumentFixture {
    /// Opens a session with the default configuration.
    pub fn new(model: Arc<Model>) -> Self {
        Self::with_config(model, Config::default())
    }

    /// Opens a session with `config`.
    pub fn with_config(model: Arc<Model>, config: Config) -> Self {
        let store = Arc::new(InMemoryDocumentStore::new());
        let session = Session::with_config(model, Store::document(Arc::clone(&store)), config)
            .expect("document model opens on a document store");
        Self { session, store }
    }

    /// A second session over the same store, for conflicting writers.
    pub fn second_session(&self) -> Session {
        Session::with_config(
            Arc::clone(self.session.model()),
            Store::document(Arc::clone(&self.store)),
            self.session.config().clone(),
        )
        .expect("document model opens on a document store")
    }
}

/// A session over a fresh in-memory relational store.
pub struct RelationalFixture {
    /// The session under test.
    pub session: Session,
    /// The store, for inspecting what was written.
    pub store: Arc<InMemoryRelationalStore>,
}

impl RelationalFixture {
    /// Opens a session with the default configuration.
    pub fn new(model: Arc<Model>) -> Self {
        Self::with_config(model, Config::default())
    }

    /// Opens a session with `config`.
    pub fn with_config(model: Arc<Model>, config: Config) -> Self {
        let store = Arc::new(InMemoryRelationalStore::new(&model));
        let session = Session::with_config(model, Store::relational(Arc::clone(&store)), config)
            .expect("relational model opens on a relational store");
        Self { session, store }
    }

    /// A second session over the same store, for conflicting writers.
    pub fn second_session(&self) -> Session {
        Session::with_config(
            Arc::clone(self.session.model()),
            Store::relational(Arc::clone(&self.store)),
            self.session.config().clone(),
        )
        .expect("relational model opens on a relational store")
    }
}

/// Adds a customer with an address to a customers-model session.
pub fn add_customer(session: &Session, id: &str, name: &str, city: &str) -> EntryId {
    let customer = session
        .add("Customer", [("Id", id), ("Name", name)])
        .expect("customer is added");
    session
        .add_owned(customer, "Address", [("Street", "1 Main St"), ("City", city)])
        .expect("address is added");
    customer
}

/// Adds an order with one line per `(sku, quantity)`.
///
/// In the relational flavour the order is linked to `customer`; in the
/// document flavour only `CustomerId` is set.
pub fn add_order(
    session: &Session,
    id: &str,
    customer: EntryId,
    lines: &[(&str, i64)],
) -> EntryId {
    let customer_id = session.value(customer, "Id").expect("customer has an id");
    let order = session
        .add(
            "Order",
            [
                ("Id", Value::from(id)),
                ("CustomerId", customer_id),
                ("Status", Value::from("new")),
            ],
        )
        .expect("order is added");
    if session.model().store_kind() == StoreKind::Relational {
        session
            .set_reference(order, "Customer", Some(customer))
            .expect("order references its customer");
    }
    for (sku, quantity) in lines {
        session
            .add_owned(
                order,
                "Lines",
                [("Sku", Value::from(*sku)), ("Quantity", Value::Integer(*quantity))],
            )
            .expect("line is added");
    }
    order
}

/// Adds a vehicle of `kind`; `engine` is ignored for unpowered kinds.
pub fn add_vehicle(
    session: &Session,
    kind: VehicleKind,
    name: &str,
    seats: i64,
    engine: Option<EngineKind>,
) -> EntryId {
    let mut values = vec![("Name", Value::from(name)), ("SeatingCapacity", Value::Integer(seats))];
    if kind.is_powered() {
        if let Some(engine) = engine {
            values.push(("Engine", Value::Integer(engine.ordinal())));
        }
    }
    session.add(kind.type_name(), values).expect("vehicle is added")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_build_for_both_store_kinds() {
        for kind in [StoreKind::Document, StoreKind::Relational] {
            let animals = animals_model(kind);
            let animal = animals.find_entity_type("Animal").unwrap();
            assert_eq!(animal.concrete_types_in_hierarchy().len(), 2);

            let customers = customers_model(kind);
            let address = customers.find_entity_type("Address").unwrap();
            assert!(address.is_owned());
            assert!(!address.is_document_root());

            let vehicles = vehicles_model(kind);
            let powered = vehicles.find_entity_type("PoweredVehicle").unwrap();
            assert_eq!(powered.concrete_types_in_hierarchy().len(), 2);
        }
    }

    #[test]
    fn engine_ordinals_round_trip() {
        for engine in EngineKind::ALL {
            assert_eq!(EngineKind::from_ordinal(&Value::Integer(engine.ordinal())), Some(engine));
        }
        assert_eq!(EngineKind::from_ordinal(&Value::Integer(9)), None);
    }
}
