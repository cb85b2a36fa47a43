//! PostgreSQL implementation of [`Store`] on a single blocking diesel connection.
//!
//! Connectivity failures drop the connection so the poll loop sees
//! `is_connected() == false` and runs its reconnect path.

use super::{Store, StoreError};
use crate::db::models as dbm;
use crate::models::device::{MenuItem, TimeRanges};
use crate::models::telemetry::*;
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::connection::{AnsiTransactionManager, TransactionManager};
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::upsert::excluded;
use diesel::PgConnection;
use log::{info, warn};

pub struct PgStore {
    database_url: String,
    conn: Option<PgConnection>,
}

impl PgStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        PgStore {
            database_url: database_url.into(),
            conn: None,
        }
    }

    /// Direct access for one-off maintenance such as running migrations.
    pub fn connection(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::NotConnected)
    }

    fn check<T>(&mut self, result: QueryResult<T>, what: &str) -> Result<T, StoreError> {
        result.map_err(|e| {
            let lost = matches!(
                e,
                DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _)
                    | DieselError::DatabaseError(DatabaseErrorKind::UnableToSendCommand, _)
                    | DieselError::BrokenTransactionManager
            );
            if lost {
                warn!("Store: lost database connection during {}: {}", what, e);
                self.conn = None;
                StoreError::Connection(format!("{} failed: {}", what, e))
            } else {
                StoreError::Query(format!("{} failed: {}", what, e))
            }
        })
    }
}

impl Store for PgStore {
    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn connect(&mut self) -> Result<(), StoreError> {
        let conn = PgConnection::establish(&self.database_url)
            .map_err(|e| StoreError::Connection(format!("DB connection failed: {}", e)))?;
        self.conn = Some(conn);
        info!("Connected to database");
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            info!("Disconnected from database");
        }
    }

    fn transaction<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, StoreError>,
    {
        let begun = AnsiTransactionManager::begin_transaction(self.connection()?);
        self.check(begun, "begin transaction")?;

        match f(self) {
            Ok(value) => {
                let committed = AnsiTransactionManager::commit_transaction(self.connection()?);
                self.check(committed, "commit")?;
                Ok(value)
            }
            Err(e) => {
                if let Ok(conn) = self.connection()
                    && let Err(rollback) = AnsiTransactionManager::rollback_transaction(conn)
                {
                    warn!("Store: rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    fn load_value_facts(&mut self) -> Result<Vec<ValueFact>, StoreError> {
        use schema::value_facts::dsl as V;

        let rows = V::value_facts
            .order(V::id.asc())
            .select(dbm::ValueFactRow::as_select())
            .load(self.connection()?);
        self.check(rows, "load value facts")?
            .into_iter()
            .map(ValueFact::try_from)
            .collect()
    }

    fn find_value_fact(&mut self, key: FactKey) -> Result<Option<ValueFact>, StoreError> {
        use schema::value_facts::dsl as V;

        let row = V::value_facts
            .filter(V::address.eq(key.address).and(V::kind.eq(key.kind.code())))
            .select(dbm::ValueFactRow::as_select())
            .first(self.connection()?)
            .optional();
        self.check(row, "find value fact")?.map(ValueFact::try_from).transpose()
    }

    fn insert_value_fact(&mut self, fact: &ValueFact) -> Result<ValueFact, StoreError> {
        use schema::value_facts::dsl as V;

        let row = diesel::insert_into(V::value_facts)
            .values(&dbm::ValueFactValues::from(fact))
            .returning(dbm::ValueFactRow::as_returning())
            .get_result(self.connection()?);
        ValueFact::try_from(self.check(row, "insert value fact")?)
    }

    fn update_value_fact(&mut self, fact: &ValueFact) -> Result<(), StoreError> {
        use schema::value_facts::dsl as V;

        let values = dbm::ValueFactChanges::from(fact);
        let updated = diesel::update(V::value_facts.find(fact.id))
            .set((&values, V::updated_at.eq(Utc::now())))
            .execute(self.connection()?);
        self.check(updated, "update value fact").map(|_| ())
    }

    fn upsert_sample(&mut self, sample: &Sample) -> Result<(), StoreError> {
        use schema::samples::dsl as S;

        let inserted = diesel::insert_into(S::samples)
            .values(&dbm::SampleRow::from(sample))
            .on_conflict((S::time, S::address, S::kind, S::aggregate))
            .do_update()
            .set((
                S::value.eq(excluded(S::value)),
                S::text.eq(excluded(S::text)),
                S::sample_count.eq(excluded(S::sample_count)),
            ))
            .execute(self.connection()?);
        self.check(inserted, "upsert sample").map(|_| ())
    }

    fn latest_raw_sample(&mut self, key: FactKey, at: DateTime<Utc>) -> Result<Option<Sample>, StoreError> {
        use schema::samples::dsl as S;

        let row = S::samples
            .filter(
                S::address
                    .eq(key.address)
                    .and(S::kind.eq(key.kind.code()))
                    .and(S::aggregate.eq(Aggregate::Raw.code()))
                    .and(S::time.le(at)),
            )
            .order(S::time.desc())
            .select(dbm::SampleRow::as_select())
            .first(self.connection()?)
            .optional();
        self.check(row, "query latest sample")?.map(Sample::try_from).transpose()
    }

    fn first_raw_sample_between(
        &mut self,
        key: FactKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError> {
        use schema::samples::dsl as S;

        let row = S::samples
            .filter(
                S::address
                    .eq(key.address)
                    .and(S::kind.eq(key.kind.code()))
                    .and(S::aggregate.eq(Aggregate::Raw.code()))
                    .and(S::time.between(from, to)),
            )
            .order(S::time.asc())
            .select(dbm::SampleRow::as_select())
            .first(self.connection()?)
            .optional();
        self.check(row, "query sample in range")?.map(Sample::try_from).transpose()
    }

    fn latest_sample_time(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        use schema::samples::dsl as S;

        let latest = S::samples
            .filter(S::aggregate.eq(Aggregate::Raw.code()))
            .select(max(S::time))
            .first::<Option<DateTime<Utc>>>(self.connection()?);
        self.check(latest, "query latest sample time")
    }

    fn raw_samples_before(&mut self, before: DateTime<Utc>) -> Result<Vec<Sample>, StoreError> {
        use schema::samples::dsl as S;

        let rows = S::samples
            .filter(S::aggregate.eq(Aggregate::Raw.code()).and(S::time.lt(before)))
            .order((S::time.asc(), S::address.asc()))
            .select(dbm::SampleRow::as_select())
            .load(self.connection()?);
        self.check(rows, "load raw samples")?
            .into_iter()
            .map(Sample::try_from)
            .collect()
    }

    fn delete_raw_samples_before(&mut self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        use schema::samples::dsl as S;

        let deleted = diesel::delete(S::samples.filter(S::aggregate.eq(Aggregate::Raw.code()).and(S::time.lt(before))))
            .execute(self.connection()?);
        self.check(deleted, "delete raw samples")
    }

    fn find_peak(&mut self, key: FactKey) -> Result<Option<Peak>, StoreError> {
        use schema::peaks::dsl as P;

        let row = P::peaks
            .find((key.address, key.kind.code()))
            .select(dbm::PeakRow::as_select())
            .first(self.connection()?)
            .optional();
        self.check(row, "find peak")?.map(Peak::try_from).transpose()
    }

    fn save_peak(&mut self, peak: &Peak) -> Result<(), StoreError> {
        use schema::peaks::dsl as P;

        let row = dbm::PeakRow::from(peak);
        let saved = diesel::insert_into(P::peaks)
            .values(&row)
            .on_conflict((P::address, P::kind))
            .do_update()
            .set((P::min.eq(row.min), P::max.eq(row.max)))
            .execute(self.connection()?);
        self.check(saved, "save peak").map(|_| ())
    }

    fn load_alert_rules(&mut self) -> Result<Vec<AlertRule>, StoreError> {
        use schema::alert_rules::dsl as A;

        let rows = A::alert_rules
            .order(A::id.asc())
            .select(dbm::AlertRuleRow::as_select())
            .load(self.connection()?);
        self.check(rows, "load alert rules")?
            .into_iter()
            .map(AlertRule::try_from)
            .collect()
    }

    fn find_alert_rule(&mut self, id: i64) -> Result<Option<AlertRule>, StoreError> {
        use schema::alert_rules::dsl as A;

        let row = A::alert_rules
            .find(id)
            .select(dbm::AlertRuleRow::as_select())
            .first(self.connection()?)
            .optional();
        self.check(row, "find alert rule")?.map(AlertRule::try_from).transpose()
    }

    fn set_last_alert(&mut self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        use schema::alert_rules::dsl as A;

        let updated = diesel::update(A::alert_rules.find(id))
            .set(A::last_alert_at.eq(Some(at)))
            .execute(self.connection()?);
        self.check(updated, "update last alert").map(|_| ())
    }

    fn replace_menu(&mut self, items: &[MenuItem]) -> Result<(), StoreError> {
        use schema::menu_items::dsl as M;

        let rows = items.iter().map(dbm::NewMenuItemRow::from).collect::<Vec<_>>();
        let replaced = self.connection()?.transaction::<_, DieselError, _>(|conn| {
            diesel::delete(M::menu_items).execute(conn)?;
            diesel::insert_into(M::menu_items).values(&rows).execute(conn)
        });
        self.check(replaced, "replace menu").map(|_| ())
    }

    fn load_menu(&mut self) -> Result<Vec<MenuItem>, StoreError> {
        use schema::menu_items::dsl as M;

        let rows = M::menu_items
            .order(M::id.asc())
            .select(dbm::MenuItemRow::as_select())
            .load(self.connection()?);
        Ok(self.check(rows, "load menu")?.into_iter().map(MenuItem::from).collect())
    }

    fn set_menu_value(&mut self, address: i32, value: &str, unit: &str) -> Result<(), StoreError> {
        use schema::menu_items::dsl as M;

        let updated = diesel::update(M::menu_items.filter(M::address.eq(address)))
            .set((M::value.eq(Some(value)), M::unit.eq(unit)))
            .execute(self.connection()?);
        self.check(updated, "update menu value").map(|_| ())
    }

    fn save_time_ranges(&mut self, ranges: &TimeRanges) -> Result<(), StoreError> {
        use schema::time_ranges::dsl as T;

        let values = dbm::TimeRangesValues::from(ranges);
        let saved = diesel::insert_into(T::time_ranges)
            .values(&values)
            .on_conflict(T::address)
            .do_update()
            .set(&values)
            .execute(self.connection()?);
        self.check(saved, "save time ranges").map(|_| ())
    }

    fn find_device_error(
        &mut self,
        number: i32,
        time1: DateTime<Utc>,
    ) -> Result<Option<DeviceErrorRecord>, StoreError> {
        use schema::device_errors::dsl as E;

        let row = E::device_errors
            .filter(E::number.eq(number).and(E::time1.eq(time1)))
            .select(dbm::DeviceErrorRow::as_select())
            .first(self.connection()?)
            .optional();
        self.check(row, "find device error")?
            .map(DeviceErrorRecord::try_from)
            .transpose()
    }

    fn save_device_error(&mut self, record: &DeviceErrorRecord) -> Result<(), StoreError> {
        use schema::device_errors::dsl as E;

        let values = dbm::DeviceErrorValues::from(record);
        let saved = match record.id {
            Some(id) => diesel::update(E::device_errors.find(id))
                .set(&values)
                .execute(self.connection()?),
            None => diesel::insert_into(E::device_errors)
                .values(&values)
                .execute(self.connection()?),
        };
        self.check(saved, "save device error").map(|_| ())
    }

    fn load_device_errors(&mut self) -> Result<Vec<DeviceErrorRecord>, StoreError> {
        use schema::device_errors::dsl as E;

        let rows = E::device_errors
            .order(E::time1.asc())
            .select(dbm::DeviceErrorRow::as_select())
            .load(self.connection()?);
        self.check(rows, "load device errors")?
            .into_iter()
            .map(DeviceErrorRecord::try_from)
            .collect()
    }
}
