use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use argon2::Argon2;
use chrono::{NaiveDate, Utc};
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use duskproto::types::{EquipmentView, Position, StatBlock};

const MAX_CHARACTERS_PER_ACCOUNT: usize = 5;
const LOCKOUT_FAILURES: u32 = 5;
const LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);

// Passwords we refuse outright regardless of policy.
const DENIED_PASSWORDS: [&str; 10] = [
    "123456",
    "12345678",
    "123456789",
    "password",
    "password1",
    "qwerty1",
    "abc123",
    "letmein1",
    "dragon1",
    "111111a",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRec {
    pub id: u64,
    pub name: String,
    pub pw_hash: String,
    pub created_unix: u64,
    #[serde(default)]
    pub last_login_unix: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRec {
    pub id: u64,
    pub account_id: u64,
    pub name: String,
    pub race: String,
    pub class: String,
    pub level: u32,
    pub experience: u64,
    pub status_points: u32,
    pub health: i32,
    pub max_health: i32,
    pub mana: i32,
    pub max_mana: i32,
    pub base_stats: StatBlock,
    pub position: Position,
    pub is_dead: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInstanceRec {
    pub instance_id: u64,
    pub template_id: u32,
    pub quantity: u32,
    /// Bag slot index; -1 while equipped.
    pub slot: i32,
    pub is_equipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRec {
    pub character_id: u64,
    pub max_slots: u32,
    pub gold: u64,
    pub equipment: EquipmentView,
    pub items: Vec<ItemInstanceRec>,
}

impl InventoryRec {
    pub fn new(character_id: u64) -> Self {
        Self {
            character_id,
            max_slots: 50,
            gold: 0,
            equipment: EquipmentView::default(),
            items: Vec::new(),
        }
    }

    pub fn item(&self, instance_id: u64) -> Option<&ItemInstanceRec> {
        self.items.iter().find(|i| i.instance_id == instance_id)
    }

    pub fn item_mut(&mut self, instance_id: u64) -> Option<&mut ItemInstanceRec> {
        self.items.iter_mut().find(|i| i.instance_id == instance_id)
    }

    /// Count of occupied bag slots (equipped items do not occupy one).
    pub fn used_slots(&self) -> usize {
        self.items.iter().filter(|i| !i.is_equipped).count()
    }

    /// Lowest free bag slot index, if any.
    pub fn free_slot(&self) -> Option<i32> {
        if self.used_slots() >= self.max_slots as usize {
            return None;
        }
        let mut used: Vec<i32> = self
            .items
            .iter()
            .filter(|i| !i.is_equipped)
            .map(|i| i.slot)
            .collect();
        used.sort_unstable();
        let mut slot = 0i32;
        for u in used {
            if u == slot {
                slot += 1;
            } else if u > slot {
                break;
            }
        }
        Some(slot)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedSkillRec {
    pub character_id: u64,
    pub skill_id: u32,
    pub level: u32,
    /// 0 = unslotted, 1..=9 a hotbar slot.
    pub slot_number: u8,
    #[serde(default)]
    pub last_used_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonsterInstanceRec {
    pub id: u64,
    pub template_id: u32,
    pub current_health: i32,
    pub position: Position,
    pub is_alive: bool,
    #[serde(default)]
    pub last_respawn_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CombatLogEntry<'a> {
    pub ts_unix_ms: u64,
    pub attacker: &'a str,
    pub target: &'a str,
    pub damage: i32,
    pub critical: bool,
    pub skill_id: Option<u32>,
    pub killed: bool,
}

#[derive(Debug)]
pub enum CreateAccountOutcome {
    Created(u64),
    Rejected(&'static str),
}

#[derive(Debug)]
pub enum CreateCharacterOutcome {
    Created(CharacterRec),
    Rejected(&'static str),
}

/// A starter item granted inside the character-creation transaction.
#[derive(Debug, Clone, Copy)]
pub struct StarterGrant {
    pub template_id: u32,
    pub quantity: u32,
    pub max_stack: u32,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Minimum delay imposed on every failed login attempt.
    pub fail_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            fail_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct LoginGuard {
    failures: u32,
    locked_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<u64, AccountRec>,
    account_by_name: HashMap<String, u64>,
    characters: HashMap<u64, CharacterRec>,
    inventories: HashMap<u64, InventoryRec>,
    skills: HashMap<u64, Vec<LearnedSkillRec>>,
    monsters: HashMap<u64, MonsterInstanceRec>,
    next_account_id: u64,
    next_character_id: u64,
}

/// Durable account/character/inventory/skill/monster store.
///
/// Every table is one JSON file replaced with tmp-then-rename, so a crash
/// mid-save leaves either the old or the new contents, never a torn file.
/// "Transactional" operations mutate in memory first and roll back if the
/// file swap fails.
pub struct Store {
    root: PathBuf,
    opts: StoreOptions,
    inner: Mutex<Inner>,
    // The allocator has its own lock so item grants never contend with
    // whole-table saves.
    item_id_alloc: Mutex<u64>,
    login_guard: Mutex<HashMap<String, LoginGuard>>,
    combat_dir: PathBuf,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::open_with(root, StoreOptions::default())
    }

    pub fn open_with(root: impl Into<PathBuf>, opts: StoreOptions) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create store dir {}", root.display()))?;
        let combat_dir = root.join("combat_logs");
        std::fs::create_dir_all(&combat_dir)
            .with_context(|| format!("create combat log dir {}", combat_dir.display()))?;

        let accounts: Vec<AccountRec> = load_or_default(&root.join("accounts.json"))?;
        let characters: Vec<CharacterRec> = load_or_default(&root.join("characters.json"))?;
        let inventories: Vec<InventoryRec> = load_or_default(&root.join("inventories.json"))?;
        let skills: Vec<LearnedSkillRec> = load_or_default(&root.join("skills.json"))?;
        let monsters: Vec<MonsterInstanceRec> = load_or_default(&root.join("monsters.json"))?;
        let next_item_file: u64 = load_or_default(&root.join("next_item_id.json"))?;

        let next_account_id = accounts.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        let next_character_id = characters.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        let max_instance = inventories
            .iter()
            .flat_map(|i| i.items.iter())
            .map(|i| i.instance_id)
            .max()
            .unwrap_or(0);
        let next_item_id = next_item_file.max(max_instance + 1).max(1);

        let mut inner = Inner {
            next_account_id,
            next_character_id,
            ..Inner::default()
        };
        for a in accounts {
            inner.account_by_name.insert(a.name.clone(), a.id);
            inner.accounts.insert(a.id, a);
        }
        for c in characters {
            inner.characters.insert(c.id, c);
        }
        for i in inventories {
            inner.inventories.insert(i.character_id, i);
        }
        for s in skills {
            inner.skills.entry(s.character_id).or_default().push(s);
        }
        for m in monsters {
            inner.monsters.insert(m.id, m);
        }

        info!(
            root = %root.display(),
            accounts = inner.accounts.len(),
            characters = inner.characters.len(),
            monsters = inner.monsters.len(),
            "store opened"
        );

        Ok(Self {
            root,
            opts,
            inner: Mutex::new(inner),
            item_id_alloc: Mutex::new(next_item_id),
            login_guard: Mutex::new(HashMap::new()),
            combat_dir,
        })
    }

    pub async fn health_check(&self) -> (bool, String) {
        let probe = self.root.join(".probe");
        match std::fs::write(&probe, b"ok") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                (true, "ok".to_string())
            }
            Err(e) => (false, format!("store not writable: {e}")),
        }
    }

    // ---- accounts ----

    /// Returns the account id on success, 0 on any failure. A locked-out
    /// account fails fast without touching the store; other failures pay
    /// the configured back-off delay.
    pub async fn validate_login(&self, username: &str, password: &str) -> u64 {
        {
            let mut guard = self.login_guard.lock().await;
            if let Some(g) = guard.get_mut(username) {
                if let Some(until) = g.locked_until {
                    if Instant::now() < until {
                        return 0;
                    }
                    g.locked_until = None;
                    g.failures = 0;
                }
            }
        }

        let found = {
            let inner = self.inner.lock().await;
            inner
                .account_by_name
                .get(username)
                .and_then(|id| inner.accounts.get(id))
                .map(|a| (a.id, a.pw_hash.clone()))
        };

        let ok = match &found {
            Some((_, hash)) => match PasswordHash::new(hash) {
                // Argon2 verification is constant-time on the hash output.
                Ok(ph) => Argon2::default()
                    .verify_password(password.as_bytes(), &ph)
                    .is_ok(),
                Err(_) => false,
            },
            None => {
                // Burn comparable time so probing for usernames is not
                // cheaper than probing for passwords.
                let _ = hash_password("deliberately-wasted-work");
                false
            }
        };

        if !ok {
            {
                let mut guard = self.login_guard.lock().await;
                let g = guard.entry(username.to_string()).or_default();
                g.failures += 1;
                if g.failures >= LOCKOUT_FAILURES {
                    g.locked_until = Some(Instant::now() + LOCKOUT_DURATION);
                    warn!(account = %username, failures = g.failures, "login lockout engaged");
                }
            }
            tokio::time::sleep(self.opts.fail_delay).await;
            return 0;
        }

        self.login_guard.lock().await.remove(username);

        let (id, _) = found.expect("ok implies found");
        let mut inner = self.inner.lock().await;
        if let Some(a) = inner.accounts.get_mut(&id) {
            a.last_login_unix = Some(unix_now_s());
        }
        if let Err(e) = save_accounts(&self.root, &inner) {
            // Last-login is advisory; the login itself still succeeds.
            warn!(err = %e, "failed to persist last_login");
        }
        id
    }

    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
    ) -> anyhow::Result<CreateAccountOutcome> {
        if !username_ok(username) {
            return Ok(CreateAccountOutcome::Rejected(
                "username must be 3-20 characters of letters, digits or underscore",
            ));
        }
        if let Some(reason) = password_rejection(password) {
            return Ok(CreateAccountOutcome::Rejected(reason));
        }

        let hash = hash_password(password)?;

        let mut inner = self.inner.lock().await;
        if inner.account_by_name.contains_key(username) {
            return Ok(CreateAccountOutcome::Rejected("username already taken"));
        }

        let id = inner.next_account_id;
        inner.next_account_id += 1;
        let rec = AccountRec {
            id,
            name: username.to_string(),
            pw_hash: hash,
            created_unix: unix_now_s(),
            last_login_unix: None,
        };
        inner.account_by_name.insert(rec.name.clone(), id);
        inner.accounts.insert(id, rec);

        if let Err(e) = save_accounts(&self.root, &inner) {
            inner.accounts.remove(&id);
            inner.account_by_name.remove(username);
            inner.next_account_id = id;
            return Err(e);
        }
        info!(account = %username, id, "account created");
        Ok(CreateAccountOutcome::Created(id))
    }

    // ---- characters ----

    pub async fn list_characters(&self, account_id: u64) -> Vec<CharacterRec> {
        let inner = self.inner.lock().await;
        let mut v: Vec<CharacterRec> = inner
            .characters
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect();
        v.sort_by_key(|c| c.id);
        v
    }

    /// Character row + inventory row + starter items land in one
    /// transaction; any save failure rolls the whole creation back.
    pub async fn create_character(
        &self,
        mut character: CharacterRec,
        starter: &[StarterGrant],
    ) -> anyhow::Result<CreateCharacterOutcome> {
        if !username_ok(&character.name) {
            return Ok(CreateCharacterOutcome::Rejected(
                "character name must be 3-20 characters of letters, digits or underscore",
            ));
        }

        let starter_total: usize = starter.len();
        let ids = self.allocate_item_ids(starter_total as u64).await?;

        let mut inner = self.inner.lock().await;
        if inner
            .characters
            .values()
            .any(|c| c.name.eq_ignore_ascii_case(&character.name))
        {
            return Ok(CreateCharacterOutcome::Rejected("character name already taken"));
        }
        let owned = inner
            .characters
            .values()
            .filter(|c| c.account_id == character.account_id)
            .count();
        if owned >= MAX_CHARACTERS_PER_ACCOUNT {
            return Ok(CreateCharacterOutcome::Rejected(
                "account already has the maximum number of characters",
            ));
        }

        let id = inner.next_character_id;
        inner.next_character_id += 1;
        character.id = id;

        let mut inv = InventoryRec::new(id);
        for (i, grant) in starter.iter().enumerate() {
            inv.items.push(ItemInstanceRec {
                instance_id: ids.start + i as u64,
                template_id: grant.template_id,
                quantity: grant.quantity.clamp(1, grant.max_stack),
                slot: i as i32,
                is_equipped: false,
            });
        }

        inner.characters.insert(id, character.clone());
        inner.inventories.insert(id, inv);
        inner.skills.insert(id, Vec::new());

        let res = save_characters(&self.root, &inner).and_then(|_| save_inventories(&self.root, &inner));
        if let Err(e) = res {
            inner.characters.remove(&id);
            inner.inventories.remove(&id);
            inner.skills.remove(&id);
            inner.next_character_id = id;
            return Err(e);
        }
        info!(character = %character.name, id, "character created");
        Ok(CreateCharacterOutcome::Created(character))
    }

    pub async fn load_character(&self, id: u64) -> Option<CharacterRec> {
        self.inner.lock().await.characters.get(&id).cloned()
    }

    pub async fn update_character(&self, character: &CharacterRec) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let prev = inner.characters.insert(character.id, character.clone());
        if let Err(e) = save_characters(&self.root, &inner) {
            match prev {
                Some(p) => {
                    inner.characters.insert(p.id, p);
                }
                None => {
                    inner.characters.remove(&character.id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// One file swap for the whole periodic sweep.
    pub async fn update_characters_bulk(&self, characters: &[CharacterRec]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for c in characters {
            inner.characters.insert(c.id, c.clone());
        }
        save_characters(&self.root, &inner)
    }

    // ---- inventories ----

    pub async fn load_inventory(&self, character_id: u64) -> Option<InventoryRec> {
        self.inner.lock().await.inventories.get(&character_id).cloned()
    }

    /// Whole-inventory replacement (delete-and-reinsert semantics): the
    /// stored rows for this character become exactly `inv.items` plus the
    /// equipment references.
    pub async fn save_inventory(&self, inv: &InventoryRec) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let prev = inner.inventories.insert(inv.character_id, inv.clone());
        if let Err(e) = save_inventories(&self.root, &inner) {
            match prev {
                Some(p) => {
                    inner.inventories.insert(p.character_id, p);
                }
                None => {
                    inner.inventories.remove(&inv.character_id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    // ---- skills ----

    pub async fn load_skills(&self, character_id: u64) -> Vec<LearnedSkillRec> {
        self.inner
            .lock()
            .await
            .skills
            .get(&character_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Upsert by (character, skill): the stored set for this character
    /// becomes exactly `skills`.
    pub async fn save_skills(
        &self,
        character_id: u64,
        skills: &[LearnedSkillRec],
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let prev = inner.skills.insert(character_id, skills.to_vec());
        if let Err(e) = save_skills_file(&self.root, &inner) {
            match prev {
                Some(p) => {
                    inner.skills.insert(character_id, p);
                }
                None => {
                    inner.skills.remove(&character_id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    // ---- monsters ----

    pub async fn load_monster_instances(&self) -> Vec<MonsterInstanceRec> {
        let mut v: Vec<MonsterInstanceRec> =
            self.inner.lock().await.monsters.values().cloned().collect();
        v.sort_by_key(|m| m.id);
        v
    }

    /// First-boot seeding; no-op when instances already exist.
    pub async fn seed_monster_instances(
        &self,
        instances: Vec<MonsterInstanceRec>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.monsters.is_empty() {
            return Ok(());
        }
        for m in instances {
            inner.monsters.insert(m.id, m);
        }
        save_monsters(&self.root, &inner)
    }

    pub async fn update_monster_instances(
        &self,
        instances: &[MonsterInstanceRec],
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for m in instances {
            inner.monsters.insert(m.id, m.clone());
        }
        save_monsters(&self.root, &inner)
    }

    // ---- item instance ids ----

    /// Allocate `n` consecutive instance ids. Strictly monotonic across the
    /// server lifetime; the high-water mark is persisted before the range
    /// is handed out so a crash cannot recycle ids.
    pub async fn allocate_item_ids(&self, n: u64) -> anyhow::Result<std::ops::Range<u64>> {
        let mut alloc = self.item_id_alloc.lock().await;
        let start = *alloc;
        let end = start
            .checked_add(n)
            .context("item instance id space exhausted")?;
        save_json(&self.root.join("next_item_id.json"), &end)?;
        *alloc = end;
        Ok(start..end)
    }

    pub async fn next_item_instance_id(&self) -> anyhow::Result<u64> {
        Ok(self.allocate_item_ids(1).await?.start)
    }

    // ---- combat log ----

    pub fn log_combat(&self, entry: &CombatLogEntry<'_>) {
        let day = Utc::now().format("%Y-%m-%d");
        let path = self.combat_dir.join(format!("{day}.log"));
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(_) => return,
        };
        let res = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")
            });
        if let Err(e) = res {
            warn!(err = %e, path = %path.display(), "combat log append failed");
        }
    }

    pub fn clean_old_combat_logs(&self, days: u32) -> anyhow::Result<usize> {
        let cutoff = Utc::now().date_naive() - chrono::Days::new(days as u64);
        let mut removed = 0usize;
        for ent in std::fs::read_dir(&self.combat_dir)? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".log")) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                continue;
            };
            if date < cutoff {
                std::fs::remove_file(ent.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, days, "old combat logs cleaned");
        }
        Ok(removed)
    }
}

fn unix_now_s() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut password_hash::rand_core::OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash_password failed: {e}"))?
        .to_string())
}

fn username_ok(name: &str) -> bool {
    let len = name.chars().count();
    (3..=20).contains(&len)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn password_rejection(password: &str) -> Option<&'static str> {
    if password.len() < 6 {
        return Some("password must be at least 6 characters");
    }
    if !password.chars().any(|c| c.is_ascii_alphabetic())
        || !password.chars().any(|c| c.is_ascii_digit())
    {
        return Some("password must contain at least one letter and one digit");
    }
    let lc = password.to_ascii_lowercase();
    if DENIED_PASSWORDS.iter().any(|p| *p == lc) {
        return Some("password is too common");
    }
    None
}

fn load_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    match std::fs::read_to_string(path) {
        Ok(s) => {
            serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let s = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, s).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

fn save_accounts(root: &Path, inner: &Inner) -> anyhow::Result<()> {
    let mut v: Vec<&AccountRec> = inner.accounts.values().collect();
    v.sort_by_key(|a| a.id);
    save_json(&root.join("accounts.json"), &v)
}

fn save_characters(root: &Path, inner: &Inner) -> anyhow::Result<()> {
    let mut v: Vec<&CharacterRec> = inner.characters.values().collect();
    v.sort_by_key(|c| c.id);
    save_json(&root.join("characters.json"), &v)
}

fn save_inventories(root: &Path, inner: &Inner) -> anyhow::Result<()> {
    let mut v: Vec<&InventoryRec> = inner.inventories.values().collect();
    v.sort_by_key(|i| i.character_id);
    save_json(&root.join("inventories.json"), &v)
}

fn save_skills_file(root: &Path, inner: &Inner) -> anyhow::Result<()> {
    let mut v: Vec<&LearnedSkillRec> = inner.skills.values().flatten().collect();
    v.sort_by_key(|s| (s.character_id, s.skill_id));
    save_json(&root.join("skills.json"), &v)
}

fn save_monsters(root: &Path, inner: &Inner) -> anyhow::Result<()> {
    let mut v: Vec<&MonsterInstanceRec> = inner.monsters.values().collect();
    v.sort_by_key(|m| m.id);
    save_json(&root.join("monsters.json"), &v)
}
