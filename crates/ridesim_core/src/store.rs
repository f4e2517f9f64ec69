//! Authoritative mutable state: vehicles, customers, stop records.
//!
//! Rows live as entities in a [`bevy_ecs::world::World`]; the component
//! structs mirror the relational layout (vehicle meta/dyn split, route and
//! schedule buffers, customer rows, stop visit records). A single mutex
//! serializes every mutation: the simulator holds the guard for a whole
//! tick via [`Store::begin`], the commit protocol re-acquires it to
//! validate and write, and the snapshot helpers lock only long enough to
//! copy rows out. Readers therefore never observe a partially applied
//! write.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use bevy_ecs::prelude::{Component, Entity, World};

use crate::models::{Customer, Vehicle, VehicleKind};
use crate::types::{CustStatus, DistInt, NodeId, SimTime, Stop, TripId, VehlStatus, Waypoint};

#[derive(Component)]
struct VehicleMeta {
    id: TripId,
    orig: NodeId,
    kind: VehicleKind,
    early: SimTime,
    capacity: i32,
}

#[derive(Component)]
struct VehicleDyn {
    status: VehlStatus,
    load: i32,
    queued: i32,
}

/// Route, progress index and next-node distance are one row: every reader
/// sees them from the same committed state.
#[derive(Component)]
struct RouteBuf {
    wayps: Vec<Waypoint>,
    lvn: usize,
    nnd: DistInt,
}

#[derive(Component)]
struct ScheduleBuf {
    stops: Vec<Stop>,
}

#[derive(Component)]
struct CustomerMeta {
    id: TripId,
    orig: NodeId,
    dest: NodeId,
    early: SimTime,
    late: SimTime,
    load: i32,
}

#[derive(Component)]
struct CustomerDyn {
    status: CustStatus,
    assigned_to: Option<TripId>,
}

#[derive(Component)]
struct StopRecord {
    visited_at: Option<SimTime>,
}

pub struct Store {
    tables: Mutex<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::new()),
        }
    }

    /// Acquire the write lock for a transaction spanning several
    /// operations (the simulator holds this for a whole tick).
    pub fn begin(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().expect("store lock poisoned")
    }

    pub fn matchable_vehicles(&self, now: SimTime) -> Vec<Vehicle> {
        self.begin().matchable_vehicles(now)
    }

    pub fn waiting_customers(&self, now: SimTime) -> Vec<Customer> {
        self.begin().waiting_customers(now)
    }

    pub fn all_vehicles(&self) -> Vec<Vehicle> {
        self.begin().all_vehicles()
    }

    pub fn all_customers(&self) -> Vec<Customer> {
        self.begin().all_customers()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Tables {
    world: World,
    vehicles: HashMap<TripId, Entity>,
    customers: HashMap<TripId, Entity>,
    stops: HashMap<(TripId, NodeId), Entity>,
    base_costs: HashMap<TripId, DistInt>,
}

impl Tables {
    fn new() -> Self {
        Self {
            world: World::new(),
            vehicles: HashMap::new(),
            customers: HashMap::new(),
            stops: HashMap::new(),
            base_costs: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Row creation (initialization only)
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_vehicle(
        &mut self,
        id: TripId,
        orig: NodeId,
        kind: VehicleKind,
        early: SimTime,
        capacity: i32,
        route: Vec<Waypoint>,
        nnd: DistInt,
        schedule: Vec<Stop>,
    ) {
        let entity = self
            .world
            .spawn((
                VehicleMeta {
                    id,
                    orig,
                    kind,
                    early,
                    capacity,
                },
                VehicleDyn {
                    status: VehlStatus::Enroute,
                    load: 0,
                    queued: 0,
                },
                RouteBuf {
                    wayps: route,
                    lvn: 0,
                    nnd,
                },
                ScheduleBuf { stops: schedule },
            ))
            .id();
        self.vehicles.insert(id, entity);
    }

    pub fn insert_customer(
        &mut self,
        id: TripId,
        orig: NodeId,
        dest: NodeId,
        early: SimTime,
        late: SimTime,
        load: i32,
    ) {
        let entity = self
            .world
            .spawn((
                CustomerMeta {
                    id,
                    orig,
                    dest,
                    early,
                    late,
                    load,
                },
                CustomerDyn {
                    status: CustStatus::Waiting,
                    assigned_to: None,
                },
            ))
            .id();
        self.customers.insert(id, entity);
    }

    pub fn insert_stop_record(&mut self, owner: TripId, loc: NodeId) {
        let entity = self.world.spawn(StopRecord { visited_at: None }).id();
        self.stops.insert((owner, loc), entity);
    }

    pub fn set_base_cost(&mut self, id: TripId, cost: DistInt) {
        self.base_costs.insert(id, cost);
    }

    pub fn base_cost(&self, id: TripId) -> DistInt {
        match self.base_costs.get(&id) {
            Some(c) => *c,
            None => panic!("no base cost recorded for trip {id}"),
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    fn vehicle_entity(&self, id: TripId) -> Entity {
        match self.vehicles.get(&id) {
            Some(e) => *e,
            None => panic!("unknown vehicle {id}"),
        }
    }

    fn customer_entity(&self, id: TripId) -> Entity {
        match self.customers.get(&id) {
            Some(e) => *e,
            None => panic!("unknown customer {id}"),
        }
    }

    pub fn vehicle(&mut self, id: TripId) -> Vehicle {
        let entity = self.vehicle_entity(id);
        let meta = self.world.get::<VehicleMeta>(entity).expect("vehicle meta row");
        let dy = self.world.get::<VehicleDyn>(entity).expect("vehicle dyn row");
        let route = self.world.get::<RouteBuf>(entity).expect("vehicle route row");
        let sched = self
            .world
            .get::<ScheduleBuf>(entity)
            .expect("vehicle schedule row");
        assemble_vehicle(meta, dy, route, sched)
    }

    pub fn customer(&mut self, id: TripId) -> Customer {
        let entity = self.customer_entity(id);
        let meta = self
            .world
            .get::<CustomerMeta>(entity)
            .expect("customer meta row");
        let dy = self.world.get::<CustomerDyn>(entity).expect("customer dyn row");
        assemble_customer(meta, dy)
    }

    /// Vehicles a strategy may still assign to: not arrived, window open,
    /// and at least one seat free.
    pub fn matchable_vehicles(&mut self, now: SimTime) -> Vec<Vehicle> {
        let mut out = Vec::new();
        let mut q = self
            .world
            .query::<(&VehicleMeta, &VehicleDyn, &RouteBuf, &ScheduleBuf)>();
        for (meta, dy, route, sched) in q.iter(&self.world) {
            if dy.status != VehlStatus::Arrived
                && meta.early <= now
                && dy.load < meta.capacity
            {
                out.push(assemble_vehicle(meta, dy, route, sched));
            }
        }
        out.sort_by_key(|v| v.id);
        out
    }

    /// Customers still waiting whose request has appeared.
    pub fn waiting_customers(&mut self, now: SimTime) -> Vec<Customer> {
        let mut out = Vec::new();
        let mut q = self.world.query::<(&CustomerMeta, &CustomerDyn)>();
        for (meta, dy) in q.iter(&self.world) {
            if dy.status == CustStatus::Waiting && meta.early <= now {
                out.push(assemble_customer(meta, dy));
            }
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub fn all_vehicles(&mut self) -> Vec<Vehicle> {
        let mut out = Vec::new();
        let mut q = self
            .world
            .query::<(&VehicleMeta, &VehicleDyn, &RouteBuf, &ScheduleBuf)>();
        for (meta, dy, route, sched) in q.iter(&self.world) {
            out.push(assemble_vehicle(meta, dy, route, sched));
        }
        out.sort_by_key(|v| v.id);
        out
    }

    pub fn all_customers(&mut self) -> Vec<Customer> {
        let mut out = Vec::new();
        let mut q = self.world.query::<(&CustomerMeta, &CustomerDyn)>();
        for (meta, dy) in q.iter(&self.world) {
            out.push(assemble_customer(meta, dy));
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub fn visited_at(&mut self, owner: TripId, loc: NodeId) -> Option<SimTime> {
        let entity = *self.stops.get(&(owner, loc))?;
        self.world
            .get::<StopRecord>(entity)
            .and_then(|r| r.visited_at)
    }

    // ------------------------------------------------------------------
    // Motion
    // ------------------------------------------------------------------

    /// Subtract `speed` from every active vehicle's next-node distance.
    pub fn bulk_advance(&mut self, speed: DistInt, now: SimTime) {
        let mut q = self.world.query::<(&VehicleMeta, &VehicleDyn, &mut RouteBuf)>();
        for (meta, dy, mut route) in q.iter_mut(&mut self.world) {
            if dy.status != VehlStatus::Arrived && meta.early <= now {
                route.nnd -= speed;
            }
        }
    }

    /// Active vehicles that crossed at least one node this tick.
    pub fn stepping_vehicles(&mut self, now: SimTime) -> Vec<Vehicle> {
        let mut out = Vec::new();
        let mut q = self
            .world
            .query::<(&VehicleMeta, &VehicleDyn, &RouteBuf, &ScheduleBuf)>();
        for (meta, dy, route, sched) in q.iter(&self.world) {
            if dy.status != VehlStatus::Arrived && meta.early <= now && route.nnd <= 0 {
                out.push(assemble_vehicle(meta, dy, route, sched));
            }
        }
        out.sort_by_key(|v| v.id);
        out
    }

    // ------------------------------------------------------------------
    // Per-vehicle writes
    // ------------------------------------------------------------------

    pub fn set_route(&mut self, id: TripId, wayps: Vec<Waypoint>, lvn: usize, nnd: DistInt) {
        let entity = self.vehicle_entity(id);
        let mut route = self
            .world
            .get_mut::<RouteBuf>(entity)
            .expect("vehicle route row");
        route.wayps = wayps;
        route.lvn = lvn;
        route.nnd = nnd;
    }

    pub fn set_schedule(&mut self, id: TripId, stops: Vec<Stop>) {
        let entity = self.vehicle_entity(id);
        let mut sched = self
            .world
            .get_mut::<ScheduleBuf>(entity)
            .expect("vehicle schedule row");
        sched.stops = stops;
    }

    /// The per-tick motion write: new schedule head plus progress fields.
    pub fn set_schedule_progress(
        &mut self,
        id: TripId,
        stops: Vec<Stop>,
        lvn: usize,
        nnd: DistInt,
    ) {
        let entity = self.vehicle_entity(id);
        {
            let mut sched = self
                .world
                .get_mut::<ScheduleBuf>(entity)
                .expect("vehicle schedule row");
            sched.stops = stops;
        }
        let mut route = self
            .world
            .get_mut::<RouteBuf>(entity)
            .expect("vehicle route row");
        route.lvn = lvn;
        route.nnd = nnd;
    }

    pub fn set_vehicle_status(&mut self, id: TripId, status: VehlStatus) {
        let entity = self.vehicle_entity(id);
        let mut dy = self
            .world
            .get_mut::<VehicleDyn>(entity)
            .expect("vehicle dyn row");
        dy.status = status;
    }

    pub fn adjust_queued(&mut self, id: TripId, delta: i32) {
        let entity = self.vehicle_entity(id);
        let mut dy = self
            .world
            .get_mut::<VehicleDyn>(entity)
            .expect("vehicle dyn row");
        dy.queued += delta;
    }

    /// Physical pickup: one more onboard, customer now riding.
    pub fn pickup(&mut self, vehl: TripId, cust: TripId) {
        let entity = self.vehicle_entity(vehl);
        {
            let mut dy = self
                .world
                .get_mut::<VehicleDyn>(entity)
                .expect("vehicle dyn row");
            dy.load += 1;
        }
        self.set_customer_status(cust, CustStatus::Onboard);
    }

    /// Physical dropoff: seat freed, queue entry served, customer done.
    pub fn dropoff(&mut self, vehl: TripId, cust: TripId) {
        let entity = self.vehicle_entity(vehl);
        {
            let mut dy = self
                .world
                .get_mut::<VehicleDyn>(entity)
                .expect("vehicle dyn row");
            dy.load -= 1;
            dy.queued -= 1;
        }
        self.set_customer_status(cust, CustStatus::Arrived);
    }

    // ------------------------------------------------------------------
    // Customer writes
    // ------------------------------------------------------------------

    pub fn assign_customer(&mut self, cust: TripId, vehl: Option<TripId>) {
        let entity = self.customer_entity(cust);
        let mut dy = self
            .world
            .get_mut::<CustomerDyn>(entity)
            .expect("customer dyn row");
        dy.assigned_to = vehl;
    }

    pub fn set_customer_status(&mut self, cust: TripId, status: CustStatus) {
        let entity = self.customer_entity(cust);
        let mut dy = self
            .world
            .get_mut::<CustomerDyn>(entity)
            .expect("customer dyn row");
        dy.status = status;
    }

    /// Record the visit time of a stop. Silently ignores locations with no
    /// record (synthetic taxi destinations).
    pub fn mark_visited(&mut self, owner: TripId, loc: NodeId, t: SimTime) {
        let Some(&entity) = self.stops.get(&(owner, loc)) else {
            return;
        };
        let mut rec = self
            .world
            .get_mut::<StopRecord>(entity)
            .expect("stop record row");
        rec.visited_at = Some(t);
    }

    /// Cancel every unassigned waiting customer whose matching window has
    /// elapsed; returns the ids that were canceled.
    pub fn timeout_waiting(&mut self, now: SimTime, matching_period: SimTime) -> Vec<TripId> {
        let mut canceled = Vec::new();
        let mut q = self.world.query::<(&CustomerMeta, &mut CustomerDyn)>();
        for (meta, mut dy) in q.iter_mut(&mut self.world) {
            if dy.status == CustStatus::Waiting
                && dy.assigned_to.is_none()
                && now > meta.early + matching_period
            {
                dy.status = CustStatus::Canceled;
                canceled.push(meta.id);
            }
        }
        canceled.sort_unstable();
        canceled
    }
}

fn assemble_vehicle(
    meta: &VehicleMeta,
    dy: &VehicleDyn,
    route: &RouteBuf,
    sched: &ScheduleBuf,
) -> Vehicle {
    Vehicle {
        id: meta.id,
        orig: meta.orig,
        kind: meta.kind,
        early: meta.early,
        capacity: meta.capacity,
        load: dy.load,
        queued: dy.queued,
        status: dy.status,
        route: route.wayps.clone(),
        lvn: route.lvn,
        nnd: route.nnd,
        schedule: sched.stops.clone(),
    }
}

fn assemble_customer(meta: &CustomerMeta, dy: &CustomerDyn) -> Customer {
    Customer {
        id: meta.id,
        orig: meta.orig,
        dest: meta.dest,
        early: meta.early,
        late: meta.late,
        load: meta.load,
        status: dy.status,
        assigned_to: dy.assigned_to,
    }
}
