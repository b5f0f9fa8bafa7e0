use std::collections::BTreeSet;

use async_trait::async_trait;
use log::{debug, info};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::RateCache;
use crate::errors::CacheResult;
use crate::schema::Quote;

// ------------------------------------------------------------
// Key layout
// ------------------------------------------------------------
//
// rate:<name>              JSON of the resolved quote
// platform:<p>:<name>      JSON of the quote seen from platform p
// sources:<name>           SET of platforms holding <name>
// rates:names              SET of every cached instrument name
//
// Multi-key mutations run as a MULTI pipeline or a Lua script so
// the two lookup paths never diverge.
//
const NAMES_KEY: &str = "rates:names";

fn rate_key(instrument: &str) -> String {
    format!("rate:{}", instrument)
}

fn platform_key(platform: &str, instrument: &str) -> String {
    format!("platform:{}:{}", platform, instrument)
}

fn sources_key(instrument: &str) -> String {
    format!("sources:{}", instrument)
}

static REMOVE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local existed = redis.call('DEL', KEYS[1])
        local platforms = redis.call('SMEMBERS', KEYS[2])
        for _, p in ipairs(platforms) do
            redis.call('DEL', 'platform:' .. p .. ':' .. ARGV[1])
        end
        redis.call('DEL', KEYS[2])
        redis.call('SREM', KEYS[3], ARGV[1])
        return existed
        ",
    )
});

static REMOVE_FROM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('DEL', KEYS[2]) == 0 then
            return 0
        end
        redis.call('SREM', KEYS[3], ARGV[1])

        if redis.call('SCARD', KEYS[3]) > 0 then
            return 1
        end

        local resolved = redis.call('GET', KEYS[1])
        if resolved then
            local ok, decoded = pcall(cjson.decode, resolved)
            if ok and decoded['source_platform'] == ARGV[1] then
                redis.call('DEL', KEYS[1], KEYS[3])
                redis.call('SREM', KEYS[4], ARGV[2])
            end
        end
        return 1
        ",
    )
});

static CLEAR_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local names = redis.call('SMEMBERS', KEYS[1])
        for _, name in ipairs(names) do
            for _, p in ipairs(redis.call('SMEMBERS', 'sources:' .. name)) do
                redis.call('DEL', 'platform:' .. p .. ':' .. name)
            end
            redis.call('DEL', 'sources:' .. name, 'rate:' .. name)
        end
        redis.call('DEL', KEYS[1])
        return #names
        ",
    )
});

/// Shared-store cache backend.
///
/// Quotes are stored as JSON. Every operation clones the
/// multiplexed `ConnectionManager`, which reconnects on its own;
/// while the store is unreachable, calls return `CacheError::Store`.
pub struct RedisRateCache {
    conn: ConnectionManager,
}

impl RedisRateCache {
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;

        info!("Connected to redis at {}", url);
        Ok(Self { conn })
    }

    async fn get_json(&self, key: &str) -> CacheResult<Option<Quote>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RateCache for RedisRateCache {
    async fn put(&self, quote: &Quote) -> CacheResult<()> {
        let json = serde_json::to_string(quote)?;
        let name = &quote.instrument_name;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET").arg(rate_key(name)).arg(&json).ignore()
            .cmd("SADD").arg(NAMES_KEY).arg(name).ignore();

        if !quote.source_platform.is_empty() {
            pipe.cmd("SET")
                .arg(platform_key(&quote.source_platform, name))
                .arg(&json)
                .ignore()
                .cmd("SADD")
                .arg(sources_key(name))
                .arg(&quote.source_platform)
                .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!("Cached {} in redis", quote);
        Ok(())
    }

    async fn get(&self, instrument: &str) -> CacheResult<Option<Quote>> {
        self.get_json(&rate_key(instrument)).await
    }

    async fn get_from(&self, platform: &str, instrument: &str) -> CacheResult<Option<Quote>> {
        self.get_json(&platform_key(platform, instrument)).await
    }

    async fn remove(&self, instrument: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = REMOVE_SCRIPT
            .key(rate_key(instrument))
            .key(sources_key(instrument))
            .key(NAMES_KEY)
            .arg(instrument)
            .invoke_async(&mut conn)
            .await?;

        Ok(removed > 0)
    }

    async fn remove_from(&self, platform: &str, instrument: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = REMOVE_FROM_SCRIPT
            .key(rate_key(instrument))
            .key(platform_key(platform, instrument))
            .key(sources_key(instrument))
            .key(NAMES_KEY)
            .arg(platform)
            .arg(instrument)
            .invoke_async(&mut conn)
            .await?;

        Ok(removed > 0)
    }

    async fn instrument_names(&self) -> CacheResult<BTreeSet<String>> {
        let mut conn = self.conn.clone();
        let names: BTreeSet<String> = redis::cmd("SMEMBERS")
            .arg(NAMES_KEY)
            .query_async(&mut conn)
            .await?;

        Ok(names)
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let cleared: i64 = CLEAR_SCRIPT.key(NAMES_KEY).invoke_async(&mut conn).await?;

        info!("Redis rate cache cleared ({} instruments)", cleared);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util;

    #[test]
    fn key_layout() {
        assert_eq!(rate_key("USDTRY"), "rate:USDTRY");
        assert_eq!(platform_key("PF1", "PF1_USDTRY"), "platform:PF1:PF1_USDTRY");
        assert_eq!(sources_key("PF1_USDTRY"), "sources:PF1_USDTRY");
    }

    #[test]
    fn stored_json_exposes_source_platform() {
        // the eviction script reads this field with cjson
        let quote = Quote::raw("PF2", "PF2_USDTRY", 29.95, 30.05, util::now());
        let json = serde_json::to_value(&quote).unwrap();

        assert_eq!(json["source_platform"], "PF2");

        let back: Quote = serde_json::from_value(json).unwrap();
        assert_eq!(back, quote);
    }
}
