//! Run/audit record persistence (§10.6): a small `sqlx`-backed Postgres
//! repository trait — a trait for testability, a Postgres-backed
//! production implementation. This is the operational run/audit ledger the
//! core owns, not the "database schema for business entities" the
//! top-level Non-goals exclude (§1, §10.6).

use async_trait::async_trait;
use sqlx::PgPool;

use crate::pipeline::RunRecord;
use crate::proxy::audit::AuditRecord;

#[async_trait]
pub trait AuditRepo: Send + Sync + 'static {
	async fn ping(&self) -> anyhow::Result<()>;
	async fn record_run(&self, run: &RunRecord) -> anyhow::Result<()>;
	async fn record_proxy_audit(&self, record: &AuditRecord) -> anyhow::Result<()>;
}

/// Production Postgres-backed repository. Run records are upserted by
/// `run_id` so every state transition (§4.E) overwrites the same row
/// rather than appending a new one.
pub struct PostgresAuditRepo {
	pool: PgPool,
}

impl PostgresAuditRepo {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = PgPool::connect(database_url).await?;
		Ok(Self::new(pool))
	}

	/// Apply the run/audit ledger schema. Called once at startup; safe to
	/// run repeatedly (`IF NOT EXISTS`).
	pub async fn migrate(&self) -> anyhow::Result<()> {
		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS agent_runs (
				run_id UUID PRIMARY KEY,
				tenant_id TEXT NOT NULL,
				conversation_id TEXT NOT NULL,
				state TEXT NOT NULL,
				started_at TIMESTAMPTZ NOT NULL,
				ended_at TIMESTAMPTZ,
				usage JSONB NOT NULL,
				cost_usd DOUBLE PRECISION NOT NULL,
				num_turns INTEGER NOT NULL,
				error TEXT
			)
			"#,
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS proxy_audit_log (
				id BIGSERIAL PRIMARY KEY,
				container_id TEXT NOT NULL,
				host TEXT NOT NULL,
				method TEXT NOT NULL,
				allowed BOOLEAN NOT NULL,
				recorded_at TIMESTAMPTZ NOT NULL
			)
			"#,
		)
		.execute(&self.pool)
		.await?;

		Ok(())
	}
}

#[async_trait]
impl AuditRepo for PostgresAuditRepo {
	async fn ping(&self) -> anyhow::Result<()> {
		sqlx::query("SELECT 1").execute(&self.pool).await?;
		Ok(())
	}

	async fn record_run(&self, run: &RunRecord) -> anyhow::Result<()> {
		let usage = serde_json::to_value(&run.usage)?;
		let state = serde_json::to_value(run.state)?
			.as_str()
			.unwrap_or("queued")
			.to_string();
		sqlx::query(
			r#"
			INSERT INTO agent_runs
				(run_id, tenant_id, conversation_id, state, started_at, ended_at, usage, cost_usd, num_turns, error)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
			ON CONFLICT (run_id) DO UPDATE SET
				state = EXCLUDED.state,
				ended_at = EXCLUDED.ended_at,
				usage = EXCLUDED.usage,
				cost_usd = EXCLUDED.cost_usd,
				num_turns = EXCLUDED.num_turns,
				error = EXCLUDED.error
			"#,
		)
		.bind(run.run_id)
		.bind(&run.tenant_id)
		.bind(&run.conversation_id)
		.bind(state)
		.bind(run.started_at)
		.bind(run.ended_at)
		.bind(usage)
		.bind(run.cost_usd)
		.bind(run.num_turns as i32)
		.bind(&run.error)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn record_proxy_audit(&self, record: &AuditRecord) -> anyhow::Result<()> {
		sqlx::query(
			r#"
			INSERT INTO proxy_audit_log (container_id, host, method, allowed, recorded_at)
			VALUES ($1, $2, $3, $4, $5)
			"#,
		)
		.bind(&record.container_id)
		.bind(&record.host)
		.bind(&record.method)
		.bind(record.allowed)
		.bind(record.timestamp)
		.execute(&self.pool)
		.await?;
		Ok(())
	}
}

/// In-memory test double used by pipeline/proxy tests that don't want a
/// real Postgres instance.
#[cfg(any(test, feature = "unit-tests", feature = "integration-tests"))]
pub mod test_double {
	use super::*;
	use std::sync::Mutex;

	#[derive(Default)]
	pub struct InMemoryAuditRepo {
		pub runs: Mutex<Vec<RunRecord>>,
		pub audits: Mutex<Vec<AuditRecord>>,
	}

	#[async_trait]
	impl AuditRepo for InMemoryAuditRepo {
		async fn ping(&self) -> anyhow::Result<()> {
			Ok(())
		}

		async fn record_run(&self, run: &RunRecord) -> anyhow::Result<()> {
			self.runs.lock().unwrap().push(run.clone());
			Ok(())
		}

		async fn record_proxy_audit(&self, record: &AuditRecord) -> anyhow::Result<()> {
			self.audits.lock().unwrap().push(record.clone());
			Ok(())
		}
	}
}
