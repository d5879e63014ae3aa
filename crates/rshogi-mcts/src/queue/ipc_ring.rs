//! 共有メモリ上の ring buffer（プロセス間）
//!
//! ファイルを `mmap(MAP_SHARED)` して、先頭のメタデータ領域と固定長スロット列を置く。
//! メタデータはファイル全体の `flock` を名前付き mutex として保護する。
//! プロセスをまたいだネイティブな待機手段がないため、空・満杯時は
//! バックオフ付きポーリングで待つ。
//!
//! スロットの中身: `count: u32` に続いて `batch_capacity * item_floats` 個の f32
//!
//! 相手プロセスは接続時に自分の pid をメタデータへ書く。待っている側はそれを見て
//! 相手が生きているか確かめる。

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

/// ヘッダ先頭の識別子（"RING"）
const RING_MAGIC: u32 = 0x5249_4e47;

/// メタデータ領域のバイト数（スロット列の開始位置）
const HEADER_BYTES: usize = 64;

/// 共有メタデータ
///
/// カーソルの意味:
/// - write_begin: 次に書き込みを開始するスロット
/// - write_end: 書き込み完了済みの終端（reader はここまで読める）
/// - read_begin: 次に読み込みを開始するスロット
/// - read_end: 読み込み完了済みの終端（writer はここまで再利用できる）
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct RingMeta {
    magic: u32,
    size: u32,
    batch_capacity: u32,
    item_floats: u32,
    read_begin: u32,
    read_end: u32,
    write_begin: u32,
    write_end: u32,
    reading: u32,
    writing: u32,
    /// 接続中の相手プロセスの pid（0 は未接続）
    peer_pid: u32,
}

const _: () = assert!(std::mem::size_of::<RingMeta>() <= HEADER_BYTES);

impl RingMeta {
    fn init(size: u32, batch_capacity: u32, item_floats: u32) -> Self {
        Self {
            magic: RING_MAGIC,
            size,
            batch_capacity,
            item_floats,
            read_begin: 0,
            read_end: 0,
            write_begin: 0,
            write_end: 0,
            reading: 0,
            writing: 0,
            peer_pid: 0,
        }
    }

    fn begin_read(&mut self) -> Option<u32> {
        if self.reading != 0 || self.write_end == self.read_begin {
            return None;
        }
        let cur = self.read_begin;
        self.read_begin = (cur + 1) % self.size;
        self.reading = 1;
        Some(cur)
    }

    fn end_read(&mut self) {
        self.reading = 0;
        self.read_end = (self.read_end + 1) % self.size;
    }

    fn begin_write(&mut self) -> Option<u32> {
        if self.writing != 0 {
            return None;
        }
        let cur = self.write_begin;
        let next = (cur + 1) % self.size;
        // 1スロットは常に空けて満杯と空を区別する
        if next == self.read_end {
            return None;
        }
        self.write_begin = next;
        self.writing = 1;
        Some(cur)
    }

    fn end_write(&mut self) {
        self.writing = 0;
        self.write_end = (self.write_end + 1) % self.size;
    }

    fn from_bytes(bytes: &[u8; HEADER_BYTES]) -> Self {
        let word = |i: usize| u32::from_ne_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]]);
        Self {
            magic: word(0),
            size: word(1),
            batch_capacity: word(2),
            item_floats: word(3),
            read_begin: word(4),
            read_end: word(5),
            write_begin: word(6),
            write_end: word(7),
            reading: word(8),
            writing: word(9),
            peer_pid: word(10),
        }
    }
}

/// 空・満杯時の待機（spin → yield → 短い sleep）
struct Backoff {
    fails: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { fails: 0 }
    }

    fn wait(&mut self) {
        self.fails = self.fails.saturating_add(1);
        match self.fails {
            1..=5 => std::hint::spin_loop(),
            6..=15 => std::thread::yield_now(),
            16..=25 => std::thread::sleep(Duration::from_micros(10)),
            _ => std::thread::sleep(Duration::from_micros(100)),
        }
    }
}

/// `flock` による排他区間
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn acquire(file: &'a File) -> io::Result<Self> {
        loop {
            // SAFETY: 有効な fd に対する flock 呼び出し
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // SAFETY: acquire 済みの fd の解放
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// 共有メモリ ring
pub struct IpcRing {
    file: File,
    map: NonNull<u8>,
    map_len: usize,
    size: u32,
    batch_capacity: u32,
    item_floats: u32,
    /// 同一プロセス内のスレッド間排他（flock は同じ open file description 内では排他にならない）
    local: Mutex<()>,
}

// SAFETY: マッピングへのアクセスは local + flock で直列化されるか、
// begin_read/begin_write で排他的に確保したスロットに限られる
unsafe impl Send for IpcRing {}
unsafe impl Sync for IpcRing {}

impl IpcRing {
    /// ring を新規作成（既存ファイルは初期化し直す）
    pub fn create(path: &Path, slots: u32, batch_capacity: u32, item_floats: u32) -> io::Result<Self> {
        if slots < 2 || batch_capacity == 0 || item_floats == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid ring shape: slots={slots} batch={batch_capacity} item_floats={item_floats}"),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let map_len = Self::map_len(slots, batch_capacity, item_floats);
        file.set_len(map_len as u64)?;
        let map = map_file(&file, map_len)?;
        let ring = Self {
            file,
            map,
            map_len,
            size: slots,
            batch_capacity,
            item_floats,
            local: Mutex::new(()),
        };
        ring.with_meta(|meta| *meta = RingMeta::init(slots, batch_capacity, item_floats))?;
        debug!(
            "[IpcRing] created {} slots={slots} batch={batch_capacity} item_floats={item_floats}",
            path.display()
        );
        Ok(ring)
    }

    /// 他プロセスが作成した ring に接続する
    pub fn attach(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header = [0u8; HEADER_BYTES];
        file.read_exact(&mut header)?;
        let meta = RingMeta::from_bytes(&header);
        if meta.magic != RING_MAGIC || meta.size < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not an initialized ring", path.display()),
            ));
        }
        let map_len = Self::map_len(meta.size, meta.batch_capacity, meta.item_floats);
        if file.metadata()?.len() < map_len as u64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ring file truncated"));
        }
        let map = map_file(&file, map_len)?;
        debug!("[IpcRing] attached {}", path.display());
        Ok(Self {
            file,
            map,
            map_len,
            size: meta.size,
            batch_capacity: meta.batch_capacity,
            item_floats: meta.item_floats,
            local: Mutex::new(()),
        })
    }

    fn map_len(slots: u32, batch_capacity: u32, item_floats: u32) -> usize {
        HEADER_BYTES + slots as usize * Self::stride_of(batch_capacity, item_floats)
    }

    fn stride_of(batch_capacity: u32, item_floats: u32) -> usize {
        4 + batch_capacity as usize * item_floats as usize * 4
    }

    pub fn slots(&self) -> u32 {
        self.size
    }

    /// 1スロットに載るサンプル数
    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity as usize
    }

    /// 1サンプルあたりの f32 数
    pub fn item_floats(&self) -> usize {
        self.item_floats as usize
    }

    fn with_meta<R>(&self, f: impl FnOnce(&mut RingMeta) -> R) -> io::Result<R> {
        let _local = self.local.lock();
        let _flock = FileLock::acquire(&self.file)?;
        // SAFETY: 先頭 HEADER_BYTES はメタデータ専用で、ロック中は他に参照がない
        let meta = unsafe { &mut *(self.map.as_ptr() as *mut RingMeta) };
        Ok(f(meta))
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.size);
        let offset = HEADER_BYTES + index as usize * Self::stride_of(self.batch_capacity, self.item_floats);
        // SAFETY: offset は map_len 未満
        unsafe { self.map.as_ptr().add(offset) }
    }

    /// 空きスロットがあれば `count` サンプル分の payload を書き込む
    pub fn try_push(&self, count: u32, payload: &[f32]) -> io::Result<bool> {
        let expected = count as usize * self.item_floats();
        if count > self.batch_capacity || payload.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} floats does not match count {count}", payload.len()),
            ));
        }
        let Some(index) = self.with_meta(RingMeta::begin_write)? else {
            return Ok(false);
        };
        let slot = self.slot_ptr(index);
        // SAFETY: begin_write で確保したスロットには書き手が1つだけ。
        // ヘッダ64バイト・ストライドとも4の倍数なので u32/f32 の整列を満たす
        unsafe {
            std::ptr::write(slot as *mut u32, count);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), slot.add(4) as *mut f32, payload.len());
        }
        self.with_meta(RingMeta::end_write)?;
        Ok(true)
    }

    /// 書き込めるまで待つ。`deadline` を過ぎたら TimedOut
    pub fn push_wait(&self, count: u32, payload: &[f32], deadline: Option<Instant>) -> io::Result<()> {
        let mut backoff = Backoff::new();
        loop {
            if self.try_push(count, payload)? {
                return Ok(());
            }
            check_deadline(deadline)?;
            backoff.wait();
        }
    }

    /// 読めるスロットがあれば `out` に payload を取り出し、サンプル数を返す
    pub fn try_pop(&self, out: &mut Vec<f32>) -> io::Result<Option<u32>> {
        let Some(index) = self.with_meta(RingMeta::begin_read)? else {
            return Ok(None);
        };
        let slot = self.slot_ptr(index);
        // SAFETY: begin_read で確保したスロットには読み手が1つだけで、書き込みは完了済み
        let count = unsafe { std::ptr::read(slot as *const u32) };
        let count = count.min(self.batch_capacity);
        let len = count as usize * self.item_floats();
        out.clear();
        out.reserve(len);
        unsafe {
            std::ptr::copy_nonoverlapping(slot.add(4) as *const f32, out.as_mut_ptr(), len);
            out.set_len(len);
        }
        self.with_meta(RingMeta::end_read)?;
        Ok(Some(count))
    }

    /// 読めるまで待つ。`deadline` を過ぎたら TimedOut
    pub fn pop_wait(&self, out: &mut Vec<f32>, deadline: Option<Instant>) -> io::Result<u32> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(count) = self.try_pop(out)? {
                return Ok(count);
            }
            check_deadline(deadline)?;
            backoff.wait();
        }
    }

    /// 相手プロセスとして `pid` を登録する
    pub fn register_peer(&self, pid: u32) -> io::Result<()> {
        self.with_meta(|meta| meta.peer_pid = pid)
    }

    /// 相手プロセスの登録を外す（正常終了時）
    pub fn clear_peer(&self) -> io::Result<()> {
        self.with_meta(|meta| meta.peer_pid = 0)
    }

    pub fn peer_pid(&self) -> io::Result<Option<u32>> {
        self.with_meta(|meta| (meta.peer_pid != 0).then_some(meta.peer_pid))
    }
}

/// `pid` のプロセスが存在するか（シグナル0で確かめる）
pub fn process_alive(pid: u32) -> bool {
    // 0 や負の値は kill ではプロセスグループ指定になる
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: シグナル0は存在と権限の確認だけで、何も送らない
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl Drop for IpcRing {
    fn drop(&mut self) {
        // SAFETY: map_file で得たマッピングを一度だけ解放
        unsafe {
            libc::munmap(self.map.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}

fn map_file(file: &File, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: 長さ len 以上のファイルを共有・読み書きでマップする
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

fn check_deadline(deadline: Option<Instant>) -> io::Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(io::Error::new(io::ErrorKind::TimedOut, "ring wait timed out")),
        _ => Ok(()),
    }
}
