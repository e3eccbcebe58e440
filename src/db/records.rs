use duckdb::{params, Connection, Row};
use jiff::civil::Date;

use crate::db::lib_duckdb::{date_at, date_range_filter, decimal_at};
use crate::db::CurtailmentDb;
use crate::eligibility::Eligibility;
use crate::error::Result;
use crate::model::CurtailmentRecord;

const SELECT_RECORDS: &str = r#"
SELECT
    CAST(r.settlement_date AS VARCHAR),
    r.settlement_period,
    r.farm_id,
    r.lead_party_name,
    r.volume,
    r.original_price,
    r.final_price,
    r.payment,
    r.so_flag,
    r.cadl_flag
FROM curtailment_records r"#;

fn from_row(row: &Row) -> duckdb::Result<CurtailmentRecord> {
    let period: i32 = row.get(1)?;
    Ok(CurtailmentRecord {
        settlement_date: date_at(row, 0)?,
        settlement_period: period as u8,
        farm_id: row.get(2)?,
        lead_party_name: row.get(3)?,
        volume: decimal_at(row, 4)?,
        original_price: decimal_at(row, 5)?,
        final_price: decimal_at(row, 6)?,
        payment: decimal_at(row, 7)?,
        so_flag: row.get(8)?,
        cadl_flag: row.get(9)?,
    })
}

fn insert(conn: &Connection, r: &CurtailmentRecord) -> duckdb::Result<usize> {
    conn.execute(
        r"
    INSERT INTO curtailment_records VALUES (
        CAST(? AS DATE), ?, ?, ?,
        CAST(? AS DECIMAL(18,6)), CAST(? AS DECIMAL(18,6)),
        CAST(? AS DECIMAL(18,6)), CAST(? AS DECIMAL(18,6)),
        ?, ?
    )",
        params![
            r.settlement_date.to_string(),
            r.settlement_period as i32,
            r.farm_id,
            r.lead_party_name,
            r.volume.to_string(),
            r.original_price.to_string(),
            r.final_price.to_string(),
            r.payment.to_string(),
            r.so_flag,
            r.cadl_flag,
        ],
    )
}

fn delete_key(conn: &Connection, date: Date, period: u8, farm_id: &str) -> duckdb::Result<usize> {
    conn.execute(
        r"
    DELETE FROM curtailment_records
    WHERE settlement_date = CAST(? AS DATE)
    AND settlement_period = ?
    AND farm_id = ?",
        params![date.to_string(), period as i32, farm_id],
    )
}

impl CurtailmentDb {
    /// Delete all the records of the day and insert the new ones, in one
    /// transaction.  Return the number of rows inserted.
    pub fn replace_records(&self, date: Date, records: &[CurtailmentRecord]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM curtailment_records WHERE settlement_date = CAST(? AS DATE)",
            params![date.to_string()],
        )?;
        let mut n = 0;
        for record in records.iter().filter(|r| r.settlement_date == date) {
            n += insert(&tx, record)?;
        }
        tx.commit()?;
        Ok(n)
    }

    /// Insert one record, replacing the existing one with the same key.
    pub fn upsert_record(&self, record: &CurtailmentRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        delete_key(
            &tx,
            record.settlement_date,
            record.settlement_period,
            &record.farm_id,
        )?;
        insert(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_records(&self, date: Date) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM curtailment_records WHERE settlement_date = CAST(? AS DATE)",
            params![date.to_string()],
        )?;
        Ok(n)
    }

    /// All the records of a day, eligible or not.
    pub fn get_records(&self, date: Date) -> Result<Vec<CurtailmentRecord>> {
        let conn = self.conn()?;
        let query = format!(
            "{}\nWHERE r.settlement_date = CAST(? AS DATE)\nORDER BY r.settlement_period, r.farm_id;",
            SELECT_RECORDS
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![date.to_string()], from_row)?;
        let results: Vec<CurtailmentRecord> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results)
    }

    pub fn get_eligible_records(
        &self,
        date: Date,
        rule: Eligibility,
    ) -> Result<Vec<CurtailmentRecord>> {
        let conn = self.conn()?;
        let query = format!(
            "{}\nWHERE r.settlement_date = CAST(? AS DATE)\n    AND {}\nORDER BY r.settlement_period, r.farm_id;",
            SELECT_RECORDS,
            rule.sql_predicate("r")
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![date.to_string()], from_row)?;
        let results: Vec<CurtailmentRecord> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results)
    }

    pub fn get_record(
        &self,
        date: Date,
        period: u8,
        farm_id: &str,
    ) -> Result<Option<CurtailmentRecord>> {
        let conn = self.conn()?;
        let query = format!(
            "{}\nWHERE r.settlement_date = CAST(? AS DATE)\n    AND r.settlement_period = ?\n    AND r.farm_id = ?;",
            SELECT_RECORDS
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![date.to_string(), period as i32, farm_id], from_row)?;
        let mut results: Vec<CurtailmentRecord> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results.pop())
    }

    pub fn count_eligible_records(
        &self,
        rule: Eligibility,
        range: Option<(Date, Date)>,
    ) -> Result<u64> {
        let conn = self.conn()?;
        let query = format!(
            "SELECT COUNT(*) FROM curtailment_records r WHERE {}{};",
            rule.sql_predicate("r"),
            date_range_filter("r.settlement_date", range)
        );
        let n: i64 = conn.query_row(&query, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Days between `start` and `end` (inclusive) with at least one eligible
    /// record.
    pub fn dates_with_records(&self, rule: Eligibility, start: Date, end: Date) -> Result<Vec<Date>> {
        let conn = self.conn()?;
        let query = format!(
            r"
SELECT DISTINCT CAST(r.settlement_date AS VARCHAR) AS d
FROM curtailment_records r
WHERE {}{}
ORDER BY d;",
            rule.sql_predicate("r"),
            date_range_filter("r.settlement_date", Some((start, end)))
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| date_at(row, 0))?;
        let results: Vec<Date> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use jiff::civil::date;
    use rust_decimal_macros::dec;

    use crate::db::curtailment_db::tests::{record, test_db};
    use crate::eligibility::Eligibility;
    use crate::error::Result;

    #[test]
    fn replace_records_for_date() -> Result<()> {
        let db = test_db();
        let day = date(2025, 3, 31);
        let first = vec![
            record(day, 1, "T_X-1", dec!(-10), true, false),
            record(day, 2, "T_X-1", dec!(-20), true, false),
        ];
        assert_eq!(db.replace_records(day, &first)?, 2);
        db.replace_records(date(2025, 4, 1), &[record(date(2025, 4, 1), 1, "T_X-1", dec!(-5), true, false)])?;

        let second = vec![record(day, 5, "T_Y-2", dec!(-7.5), false, true)];
        assert_eq!(db.replace_records(day, &second)?, 1);

        let xs = db.get_records(day)?;
        assert_eq!(xs, second);
        // other days are untouched
        assert_eq!(db.get_records(date(2025, 4, 1))?.len(), 1);
        Ok(())
    }

    #[test]
    fn upsert_replaces_the_key() -> Result<()> {
        let db = test_db();
        let day = date(2025, 3, 31);
        db.upsert_record(&record(day, 1, "T_X-1", dec!(-10), true, false))?;
        db.upsert_record(&record(day, 1, "T_X-1", dec!(-12.25), true, false))?;
        let xs = db.get_records(day)?;
        assert_eq!(xs.len(), 1);
        assert_eq!(xs[0].volume, dec!(-12.25));
        assert_eq!(xs[0].payment, dec!(557.375));
        let x = db.get_record(day, 1, "T_X-1")?.unwrap();
        assert_eq!(x, xs[0]);
        assert!(db.get_record(day, 2, "T_X-1")?.is_none());
        Ok(())
    }

    #[test]
    fn eligible_records_only() -> Result<()> {
        let db = test_db();
        let day = date(2025, 3, 31);
        db.replace_records(
            day,
            &[
                record(day, 1, "T_X-1", dec!(-10), true, false),
                record(day, 2, "T_X-1", dec!(-20), false, false),
                record(day, 3, "T_X-1", dec!(0), true, false),
                record(day, 4, "T_X-1", dec!(3), true, true),
            ],
        )?;
        let strict = db.get_eligible_records(day, Eligibility::VolumeAndFlag)?;
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].settlement_period, 1);
        let relaxed = db.get_eligible_records(day, Eligibility::VolumeOnly)?;
        assert_eq!(relaxed.len(), 2);
        assert_eq!(db.count_eligible_records(Eligibility::VolumeAndFlag, None)?, 1);
        assert_eq!(
            db.count_eligible_records(Eligibility::VolumeOnly, Some((day, day)))?,
            2
        );
        assert_eq!(
            db.dates_with_records(Eligibility::VolumeAndFlag, date(2025, 3, 1), date(2025, 3, 31))?,
            vec![day]
        );
        Ok(())
    }
}
