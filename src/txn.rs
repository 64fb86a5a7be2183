//! txn — пишущая транзакция поверх Env.
//!
//! Владеет chunk-ареной (все plaintext-страницы транзакции) и состоянием
//! шифрослоя. PageRef'ы, выданные транзакцией, валидны до её Drop.
//! Single-writer: одновременно живёт не больше одной пишущей транзакции
//! (Env берёт внутренний мьютекс pager'а на время каждой операции).

use anyhow::Result;
use log::debug;

use crate::env::Env;
use crate::pager::{ChunkArena, CryptoTxState, PageLocator, PageRef};

pub struct Transaction<'e> {
    env: &'e Env,
    pub id: u64,
    long_lived: bool,
    arena: ChunkArena,
    state: CryptoTxState,
    locator: Option<PageLocator>,
    committed: bool,
}

impl<'e> Transaction<'e> {
    pub(crate) fn new(env: &'e Env, id: u64, long_lived: bool) -> Self {
        let arena = ChunkArena::new(env.buffer_pool());
        let locator = env.locator_pool().allocate_page_locator(long_lived);
        Self {
            env,
            id,
            long_lived,
            arena,
            state: CryptoTxState::new(),
            locator: Some(locator),
            committed: false,
        }
    }

    #[inline]
    pub fn is_long_lived(&self) -> bool {
        self.long_lived
    }

    /// Страница для чтения.
    pub fn get_page(&mut self, page_number: u64) -> Result<PageRef> {
        if let Some(loc) = &self.locator {
            if let Some(r) = loc.try_get_readable(page_number) {
                return Ok(r);
            }
        }
        let r = self.acquire(page_number)?;
        if let Some(loc) = &mut self.locator {
            loc.set_readable(page_number, r);
        }
        Ok(r)
    }

    /// Страница для модификации. Отдельного copy-on-write нет: буфер один на
    /// транзакцию, изменённость определяется хешем содержимого на коммите.
    pub fn modify_page(&mut self, page_number: u64) -> Result<PageRef> {
        if let Some(loc) = &self.locator {
            if let Some(r) = loc.try_get_writable(page_number) {
                return Ok(r);
            }
        }
        let r = self.acquire(page_number)?;
        if let Some(loc) = &mut self.locator {
            loc.set_writable(page_number, r);
        }
        Ok(r)
    }

    fn acquire(&mut self, page_number: u64) -> Result<PageRef> {
        let pager = self.env.pager().lock().unwrap();
        self.env
            .crypto()
            .acquire_page_pointer(&pager, &mut self.arena, &mut self.state, page_number)
    }

    /// Выделить новую аллокацию из count листов.
    pub fn allocate_page(&mut self, count: usize, flags: u8) -> Result<(u64, PageRef)> {
        let mut pager = self.env.pager().lock().unwrap();
        let (pn, r) = self.env.crypto().acquire_new_page(
            &mut pager,
            &mut self.arena,
            &mut self.state,
            count,
            flags,
        )?;
        drop(pager);
        if let Some(loc) = &mut self.locator {
            loc.set_writable(pn, r);
        }
        Ok((pn, r))
    }

    /// Разрезать multi-page аллокацию на независимые одностраничные буферы.
    /// Все части попадают в write-set коммита как самостоятельные страницы.
    pub fn break_large_allocation(&mut self, page_number: u64) -> Result<()> {
        let pager = self.env.pager().lock().unwrap();
        let ps = pager.page_size() as u32;
        let span_pages = self
            .state
            .get(page_number)
            .map(|b| (b.page.len / ps.max(1)) as u64)
            .unwrap_or(0);
        self.env
            .crypto()
            .break_large_allocation(&pager, &mut self.arena, &mut self.state, page_number)?;
        drop(pager);
        // PageRef'ы span'а изменились: locator не должен отдавать старые view
        if let Some(loc) = &mut self.locator {
            for i in 0..span_pages {
                loc.reset(page_number + i);
            }
        }
        Ok(())
    }

    /// Пометить страницу освобождённой: из write-set'а коммита она выпадает.
    pub fn free_page(&mut self, page_number: u64) {
        self.state.skip_on_commit(page_number);
        if let Some(loc) = &mut self.locator {
            loc.reset(page_number);
        }
    }

    #[inline]
    pub fn data(&self, r: PageRef) -> &[u8] {
        self.arena.slice(r)
    }

    #[inline]
    pub fn data_mut(&mut self, r: PageRef) -> &mut [u8] {
        self.arena.slice_mut(r)
    }

    /// Закоммитить транзакцию: журнал, затем data-файл.
    pub fn commit(mut self) -> Result<()> {
        if self.state.is_empty() {
            self.committed = true;
            return Ok(());
        }
        let images = self.env.crypto().tx_on_commit(&self.arena, &self.state)?;
        if images.is_empty() {
            debug!("tx {}: nothing changed, commit is a no-op", self.id);
            self.committed = true;
            return Ok(());
        }
        self.env.commit_images(self.id, &images)?;
        self.committed = true;
        Ok(())
    }

    /// Откат — просто не коммитить; Drop вернёт ресурсы.
    pub fn rollback(mut self) {
        self.committed = false;
        debug!("tx {}: rolled back ({} page(s) loaded)", self.id, self.state.len());
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(loc) = self.locator.take() {
            self.env.locator_pool().free_page_locator(loc);
        }
        // arena Drop вернёт chunk'и в пул
        if !self.committed && !self.state.is_empty() {
            debug!("tx {}: dropped without commit", self.id);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("long_lived", &self.long_lived)
            .field("loaded_pages", &self.state.len())
            .finish()
    }
}
