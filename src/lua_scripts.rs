//! Lua脚本
//!
//! 计数器与全局聚合在 Redis 上的原子操作。时间戳（毫秒）由调用方的时钟传入，
//! 服务器端的 TTL 只用于回收空间，逻辑过期以记录中的时间戳为准。

use redis::Script;

/// Lua脚本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaScriptType {
    /// 读取计数器
    CounterGet,
    /// 替换计数器
    CounterSet,
    /// 条件替换计数器
    CounterCas,
    /// 登记全局成员
    GlobalAdd,
    /// 全局成员数
    GlobalCount,
}

impl LuaScriptType {
    /// 获取脚本名称
    pub fn name(&self) -> &'static str {
        match self {
            LuaScriptType::CounterGet => "counter_get",
            LuaScriptType::CounterSet => "counter_set",
            LuaScriptType::CounterCas => "counter_cas",
            LuaScriptType::GlobalAdd => "global_add",
            LuaScriptType::GlobalCount => "global_count",
        }
    }

    /// 脚本源码
    pub fn source(&self) -> &'static str {
        match self {
            LuaScriptType::CounterGet => COUNTER_GET_SCRIPT,
            LuaScriptType::CounterSet => COUNTER_SET_SCRIPT,
            LuaScriptType::CounterCas => COUNTER_CAS_SCRIPT,
            LuaScriptType::GlobalAdd => GLOBAL_ADD_SCRIPT,
            LuaScriptType::GlobalCount => GLOBAL_COUNT_SCRIPT,
        }
    }
}

/// 读取计数器
///
/// 参数: KEYS[1] - 计数器键, ARGV[1] - now (ms)
/// 返回: `{count, expires_at}`，不存在或已过期时返回空表（并删除过期记录）
pub const COUNTER_GET_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])

local values = redis.call('HMGET', key, 'count', 'expires_at')
if not values[1] or not values[2] then
    return {}
end

local expires_at = tonumber(values[2])
if expires_at <= now then
    redis.call('DEL', key)
    return {}
end

return {tonumber(values[1]), expires_at}
"#;

/// 替换计数器
///
/// 参数: KEYS[1] - 计数器键, ARGV[1] - count, ARGV[2] - expires_at (ms), ARGV[3] - ttl (ms)
/// 返回: expires_at
pub const COUNTER_SET_SCRIPT: &str = r#"
local key = KEYS[1]
local count = tonumber(ARGV[1])
local expires_at = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

redis.call('DEL', key)
redis.call('HSET', key, 'count', count, 'expires_at', expires_at)
redis.call('PEXPIRE', key, ttl)

return expires_at
"#;

/// 条件替换计数器
///
/// 参数: KEYS[1] - 计数器键,
///       ARGV[1] - 期望的 count（期望不存在时为 -1）, ARGV[2] - 期望的 expires_at (ms),
///       ARGV[3] - 新 count, ARGV[4] - 新 expires_at (ms), ARGV[5] - ttl (ms), ARGV[6] - now (ms)
/// 返回: 1 表示已写入，0 表示记录已被修改（过期记录按不存在处理）
pub const COUNTER_CAS_SCRIPT: &str = r#"
local key = KEYS[1]
local expected_count = tonumber(ARGV[1])
local expected_expires_at = tonumber(ARGV[2])
local now = tonumber(ARGV[6])

local values = redis.call('HMGET', key, 'count', 'expires_at')
local present = values[1] and values[2] and tonumber(values[2]) > now

if expected_count < 0 then
    if present then
        return 0
    end
elseif not present
    or tonumber(values[1]) ~= expected_count
    or tonumber(values[2]) ~= expected_expires_at then
    return 0
end

redis.call('DEL', key)
redis.call('HSET', key, 'count', tonumber(ARGV[3]), 'expires_at', tonumber(ARGV[4]))
redis.call('PEXPIRE', key, tonumber(ARGV[5]))

return 1
"#;

/// 登记全局成员
///
/// 窗口按登记后的成员数在脚本内选择：达到 blocks_limit 时使用 time_blocked 对应的过期时间。
///
/// 参数: KEYS[1] - 成员集合键, KEYS[2] - 过期时间键,
///       ARGV[1] - 成员, ARGV[2] - now (ms),
///       ARGV[3] - now + time_limit (ms), ARGV[4] - now + time_blocked (ms),
///       ARGV[5] - blocks_limit, ARGV[6] - reset_time_on_retry (0/1)
/// 返回: 登记后的成员数
pub const GLOBAL_ADD_SCRIPT: &str = r#"
local members_key = KEYS[1]
local exp_key = KEYS[2]
local member = ARGV[1]
local now = tonumber(ARGV[2])
local limit_expires_at = tonumber(ARGV[3])
local blocked_expires_at = tonumber(ARGV[4])
local blocks_limit = tonumber(ARGV[5])
local reset = tonumber(ARGV[6])

local current = tonumber(redis.call('GET', exp_key) or '0')
if current <= now then
    redis.call('DEL', members_key, exp_key)
    current = now
end

local added = redis.call('SADD', members_key, member)
local members = redis.call('SCARD', members_key)

local expires_at = limit_expires_at
if members >= blocks_limit then
    expires_at = blocked_expires_at
end

if added == 1 then
    if expires_at > current then
        current = expires_at
    end
elseif reset == 1 then
    current = expires_at
end

local ttl = current - now
if ttl < 1 then
    ttl = 1
end

redis.call('SET', exp_key, current, 'PX', ttl)
redis.call('PEXPIRE', members_key, ttl)

return members
"#;

/// 全局成员数
///
/// 参数: KEYS[1] - 成员集合键, KEYS[2] - 过期时间键, ARGV[1] - now (ms)
/// 返回: 成员数，窗口过期时清空并返回 0
pub const GLOBAL_COUNT_SCRIPT: &str = r#"
local members_key = KEYS[1]
local exp_key = KEYS[2]
local now = tonumber(ARGV[1])

local current = tonumber(redis.call('GET', exp_key) or '0')
if current <= now then
    redis.call('DEL', members_key, exp_key)
    return 0
end

return redis.call('SCARD', members_key)
"#;

/// 预编译的脚本集合
///
/// [`Script`] 先尝试 EVALSHA，服务器缺少脚本时自动回退到 EVAL。
#[derive(Debug, Clone)]
pub struct LuaScripts {
    pub counter_get: Script,
    pub counter_set: Script,
    pub counter_cas: Script,
    pub global_add: Script,
    pub global_count: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        Self {
            counter_get: Script::new(LuaScriptType::CounterGet.source()),
            counter_set: Script::new(LuaScriptType::CounterSet.source()),
            counter_cas: Script::new(LuaScriptType::CounterCas.source()),
            global_add: Script::new(LuaScriptType::GlobalAdd.source()),
            global_count: Script::new(LuaScriptType::GlobalCount.source()),
        }
    }

    /// 脚本 SHA1
    pub fn hash(&self, script_type: LuaScriptType) -> &str {
        match script_type {
            LuaScriptType::CounterGet => self.counter_get.get_hash(),
            LuaScriptType::CounterSet => self.counter_set.get_hash(),
            LuaScriptType::CounterCas => self.counter_cas.get_hash(),
            LuaScriptType::GlobalAdd => self.global_add.get_hash(),
            LuaScriptType::GlobalCount => self.global_count.get_hash(),
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
