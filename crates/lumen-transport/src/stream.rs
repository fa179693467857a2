use crate::error::TransportError;
use crate::plain::{PlainTransport, resolve};
use crate::secure::SecureTransport;
use crate::transport::{AcceptOutcome, ReadOutcome, Transport};
use crate::write_op::{Advance, WriteCallback, WriteOperation};
use bytes::Bytes;
use lumen_reactor::{IoWatcher, LoopHandle, Ready};
use mio::Interest;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::rc::{Rc, Weak};

/// 套接字流的生命周期状态。
///
/// `Closed` 为终态；关闭幂等，重复关闭是空操作。读路径与接受循环按
/// 当前状态互斥：同一时刻只有其一生效。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Uninitialized,
    AcceptingConnections,
    Open,
    Closed,
}

/// 读回调：就绪数据以切片交付；空切片表示对端有序关闭，随后流自动关闭。
pub type ReadCallback = Box<dyn FnMut(&SocketStream, &[u8])>;
/// 新连接回调：接受循环每纳入一个连接调用一次。
pub type AcceptCallback = Box<dyn FnMut(SocketStream)>;
/// 出站连接完成回调。
pub type ConnectedCallback = Box<dyn FnOnce(&SocketStream)>;

const READ_BUF_SIZE: usize = 16 * 1024;

struct StreamInner {
    loop_handle: LoopHandle,
    transport: Box<dyn Transport>,
    state: SocketState,
    watcher: Option<IoWatcher>,
    interest: Option<Interest>,
    connect_pending: bool,
    peer: Option<SocketAddr>,
    read_buf: Vec<u8>,
    read_callback: Option<ReadCallback>,
    accept_callback: Option<AcceptCallback>,
    connected_callback: Option<ConnectedCallback>,
    write_queue: VecDeque<WriteOperation>,
}

impl StreamInner {
    fn new(loop_handle: LoopHandle, transport: Box<dyn Transport>) -> Self {
        StreamInner {
            loop_handle,
            transport,
            state: SocketState::Uninitialized,
            watcher: None,
            interest: None,
            connect_pending: false,
            peer: None,
            read_buf: vec![0u8; READ_BUF_SIZE],
            read_callback: None,
            accept_callback: None,
            connected_callback: None,
            write_queue: VecDeque::new(),
        }
    }

    /// 按当前状态推导应当注册的就绪方向。
    fn desired_interest(&self) -> Option<Interest> {
        match self.state {
            SocketState::AcceptingConnections => Some(Interest::READABLE),
            SocketState::Open | SocketState::Uninitialized if self.connect_pending => {
                Some(Interest::READABLE | Interest::WRITABLE)
            }
            SocketState::Open => {
                let mut interest = Interest::READABLE;
                if !self.write_queue.is_empty() || self.transport.wants_write() {
                    interest |= Interest::WRITABLE;
                }
                Some(interest)
            }
            _ => None,
        }
    }
}

/// 非阻塞、队列化写入的套接字流；明文与加密变体共用本状态机。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把 `{监听, 连接, 读, 排队写, 关闭}` 的公共契约集中在一个组合式
///   状态机中，传输差异（原生收发 / TLS 记录层）下沉到传输对象；
/// - 句柄可廉价克隆（内部 `Rc<RefCell<_>>`），HTTP 输出流与应用层共享
///   同一条流而无需关心所有权。
///
/// ## 逻辑（How）
/// - 构造时选定传输变体；`listen`/`connect` 注册就绪监视器，之后一切
///   推进都由事件循环的就绪派发驱动；
/// - 可读：接受态跑接受循环，打开态先 `pump`（TLS 机械）再把明文交给
///   读回调；读到 0 字节视为对端有序关闭（回调收到空切片后流关闭）；
/// - 可写：先完成未决的出站连接，再自队首排水写队列；部分写保留游标，
///   操作完成才出队并触发回调；写失败中止本轮排水并关闭流；
/// - `WRITABLE` 关注点只在「队列非空或传输自身有待冲刷数据」时保持，
///   避免空转唤醒。
///
/// ## 契约（What）
/// - 同一条流上写操作严格按入队顺序完成；
/// - `close` 幂等：注销监视器、释放描述符与会话资源恰好一次，未完成
///   写操作的回调永不触发；
/// - 运行期读写错误不向调用方抛出，以关闭所在连接并记日志收场。
#[derive(Clone)]
pub struct SocketStream {
    inner: Rc<RefCell<StreamInner>>,
}

impl SocketStream {
    /// 明文流。
    pub fn plain(loop_handle: &LoopHandle) -> Self {
        SocketStream {
            inner: Rc::new(RefCell::new(StreamInner::new(
                loop_handle.clone(),
                Box::new(PlainTransport::new()),
            ))),
        }
    }

    /// 加密流；构造即加载证书与私钥，失败同步返回
    /// [`TransportError::TlsInitFailed`]。
    pub fn secure(
        loop_handle: &LoopHandle,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        let transport = SecureTransport::new(cert_path, key_path)?;
        Ok(SocketStream {
            inner: Rc::new(RefCell::new(StreamInner::new(
                loop_handle.clone(),
                Box::new(transport),
            ))),
        })
    }

    fn from_accepted(
        loop_handle: LoopHandle,
        transport: Box<dyn Transport>,
        peer: SocketAddr,
    ) -> Self {
        let stream = SocketStream {
            inner: Rc::new(RefCell::new(StreamInner::new(loop_handle, transport))),
        };
        {
            let mut inner = stream.inner.borrow_mut();
            inner.state = SocketState::Open;
            inner.peer = Some(peer);
        }
        if let Err(err) = stream.arm_watcher() {
            tracing::error!(target: "lumen::transport", "注册已接受连接失败: {err}");
            stream.close();
        }
        stream
    }

    pub fn state(&self) -> SocketState {
        self.inner.borrow().state
    }

    /// 对端地址的文本形式；未进入打开态时为 `None`。
    pub fn peer_addr(&self) -> Option<String> {
        let inner = self.inner.borrow();
        inner.peer.map(|addr| addr.ip().to_string())
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.inner.borrow().peer.map(|addr| addr.port())
    }

    /// 本地绑定端口；监听在端口 0 上时返回实际分配的端口。
    pub fn local_port(&self) -> Option<u16> {
        self.inner
            .borrow()
            .transport
            .local_addr()
            .map(|addr| addr.port())
    }

    /// 所属事件循环的句柄，供上层发起阻塞元数据查询。
    pub fn loop_handle(&self) -> LoopHandle {
        self.inner.borrow().loop_handle.clone()
    }

    /// 绑定并开始监听；成功后进入接受态并注册可读就绪。
    pub fn listen(&self, host: &str, port: u16) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != SocketState::Uninitialized {
                return Err(TransportError::InvalidState(
                    "listen requires an uninitialized stream",
                ));
            }
            inner.transport.listen(host, port)?;
            inner.state = SocketState::AcceptingConnections;
        }
        if let Err(err) = self.arm_watcher() {
            tracing::error!(target: "lumen::transport", "注册监听套接字失败: {err}");
            // 回滚：监听套接字不得在无人派发的接受态中存活。
            self.close();
            return Err(TransportError::BindFailed(-1));
        }
        Ok(())
    }

    /// 设置接受循环的回调；每个新连接都是一条已打开的流。
    pub fn on_connection_accepted(&self, callback: impl FnMut(SocketStream) + 'static) {
        self.inner.borrow_mut().accept_callback = Some(Box::new(callback));
    }

    /// 发起出站连接；完成经由 [`SocketStream::on_connected`] 通知。
    pub fn connect(&self, host: &str, port: u16) -> Result<(), TransportError> {
        let addr = resolve(host, port)
            .map_err(|err| TransportError::ConnectFailed(crate::error::errno(&err)))?;
        self.connect_addr(addr)
    }

    /// 面向回环地址的便捷连接。
    pub fn connect_local(&self, port: u16) -> Result<(), TransportError> {
        self.connect_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn connect_addr(&self, addr: SocketAddr) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != SocketState::Uninitialized {
                return Err(TransportError::InvalidState(
                    "connect requires an uninitialized stream",
                ));
            }
            inner.transport.connect(addr)?;
            inner.connect_pending = true;
        }
        if let Err(err) = self.arm_watcher() {
            tracing::error!(target: "lumen::transport", "注册出站连接失败: {err}");
            self.close();
            return Err(TransportError::ConnectFailed(-1));
        }
        Ok(())
    }

    pub fn on_connected(&self, callback: impl FnOnce(&SocketStream) + 'static) {
        self.inner.borrow_mut().connected_callback = Some(Box::new(callback));
    }

    /// 开始读取：设置读回调并确保可读关注点。
    ///
    /// 立即做一轮读取尝试：边沿风格的就绪通知不会为「注册回调之前就
    /// 已到达」的数据再次触发事件。
    pub fn start_reading(&self, callback: impl FnMut(&SocketStream, &[u8]) + 'static) {
        self.inner.borrow_mut().read_callback = Some(Box::new(callback));
        self.update_interest();
        if self.state() == SocketState::Open {
            read_ready(self);
        }
    }

    /// 便捷写入：把字节拷贝为单段负载排入写队列。
    pub fn write(&self, data: &[u8], callback: Option<WriteCallback>) {
        self.queue_write(WriteOperation::single(
            Bytes::copy_from_slice(data),
            callback,
        ));
    }

    /// 追加一个写操作；排水由可写就绪驱动。
    ///
    /// 已关闭的流丢弃操作，其回调按契约永不触发。
    pub fn queue_write(&self, op: WriteOperation) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == SocketState::Closed {
                tracing::debug!(target: "lumen::transport", "向已关闭的流写入，操作被丢弃");
                return;
            }
            inner.write_queue.push_back(op);
        }
        self.update_interest();
    }

    /// 手动重协商（仅加密流）。
    pub fn redo_handshake(&self) -> Result<(), TransportError> {
        let result = self.inner.borrow_mut().transport.redo_handshake();
        self.update_interest();
        result
    }

    /// 幂等关闭：注销监视器、释放传输资源，丢弃未完成的写操作。
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == SocketState::Closed {
            return;
        }
        inner.state = SocketState::Closed;
        inner.connect_pending = false;
        let watcher = inner.watcher.take();
        if let (Some(watcher), Some(source)) = (watcher, inner.transport.source()) {
            watcher.deregister(source);
        }
        inner.transport.teardown();
        // 未交付操作的完成回调永不触发。
        inner.write_queue.clear();
        inner.read_callback = None;
        inner.accept_callback = None;
        inner.connected_callback = None;
    }

    /// 注册就绪监视器，把就绪派发接到本流。
    fn arm_watcher(&self) -> Result<(), lumen_reactor::ReactorError> {
        let weak = Rc::downgrade(&self.inner);
        let mut inner = self.inner.borrow_mut();
        let Some(interest) = inner.desired_interest() else {
            return Ok(());
        };
        let handle = inner.loop_handle.clone();
        let inner_mut = &mut *inner;
        let Some(source) = inner_mut.transport.source() else {
            return Ok(());
        };
        let watcher = handle.register_io(source, interest, move |ready| {
            dispatch(&weak, ready);
        })?;
        inner_mut.watcher = Some(watcher);
        inner_mut.interest = Some(interest);
        Ok(())
    }

    /// 根据状态与队列情况调整关注点；只在变化时触碰注册表。
    fn update_interest(&self) {
        let mut inner = self.inner.borrow_mut();
        let Some(desired) = inner.desired_interest() else {
            return;
        };
        if inner.interest == Some(desired) {
            return;
        }
        let inner_mut = &mut *inner;
        let (Some(watcher), Some(source)) =
            (inner_mut.watcher.as_ref(), inner_mut.transport.source())
        else {
            return;
        };
        match watcher.modify(source, desired) {
            Ok(()) => inner_mut.interest = Some(desired),
            Err(err) => {
                tracing::warn!(target: "lumen::transport", "调整就绪关注点失败: {err}");
            }
        }
    }
}

/// 就绪派发入口；`weak` 升级失败说明流已销毁，事件静默丢弃。
fn dispatch(weak: &Weak<RefCell<StreamInner>>, ready: Ready) {
    let Some(inner) = weak.upgrade() else { return };
    let stream = SocketStream { inner };

    if ready.readable {
        match stream.state() {
            SocketState::AcceptingConnections => accept_loop(&stream),
            SocketState::Open => read_ready(&stream),
            _ => {}
        }
    }
    if ready.writable && stream.state() != SocketState::Closed {
        writable_ready(&stream);
    }
}

/// 接受循环：一直 `accept` 到 `WouldBlock`，每个连接回调一次。
fn accept_loop(stream: &SocketStream) {
    loop {
        let outcome = {
            let mut inner = stream.inner.borrow_mut();
            if inner.state != SocketState::AcceptingConnections {
                return;
            }
            inner.transport.accept()
        };
        match outcome {
            AcceptOutcome::Accepted { transport, peer } => {
                let handle = stream.loop_handle();
                let accepted = SocketStream::from_accepted(handle, transport, peer);
                invoke_accept_callback(stream, accepted);
            }
            AcceptOutcome::WouldBlock => return,
            AcceptOutcome::Failed(code) => {
                // 单次 accept 失败（EMFILE 等）不终止监听。
                tracing::warn!(target: "lumen::transport", "接受连接失败 (errno {code})");
                return;
            }
        }
    }
}

fn invoke_accept_callback(stream: &SocketStream, accepted: SocketStream) {
    let callback = stream.inner.borrow_mut().accept_callback.take();
    let Some(mut callback) = callback else { return };
    callback(accepted);
    let mut inner = stream.inner.borrow_mut();
    if inner.accept_callback.is_none() && inner.state == SocketState::AcceptingConnections {
        inner.accept_callback = Some(callback);
    }
}

/// 打开态的可读处理：先推进传输机械，再把明文交给读回调。
fn read_ready(stream: &SocketStream) {
    {
        let mut inner = stream.inner.borrow_mut();
        if let Err(code) = inner.transport.pump() {
            drop(inner);
            let err = TransportError::TransportReadError(code);
            tracing::warn!(target: "lumen::transport", "传输机械推进失败，关闭流: {err}");
            stream.close();
            return;
        }
    }

    loop {
        enum Step {
            Deliver(Bytes),
            Eof,
            Fatal(i32),
            Idle,
        }
        let step = {
            let mut inner = stream.inner.borrow_mut();
            if inner.state != SocketState::Open || inner.read_callback.is_none() {
                Step::Idle
            } else {
                let inner_mut = &mut *inner;
                match inner_mut.transport.read(&mut inner_mut.read_buf) {
                    ReadOutcome::Data(n) => {
                        Step::Deliver(Bytes::copy_from_slice(&inner_mut.read_buf[..n]))
                    }
                    ReadOutcome::Eof => Step::Eof,
                    ReadOutcome::WouldBlock => Step::Idle,
                    ReadOutcome::Failed(code) => Step::Fatal(code),
                }
            }
        };
        match step {
            Step::Deliver(data) => deliver_read(stream, &data),
            Step::Eof => {
                // 对端有序关闭：回调观察到空切片，然后流关闭。
                deliver_read(stream, &[]);
                stream.close();
                return;
            }
            Step::Fatal(code) => {
                let err = TransportError::TransportReadError(code);
                tracing::warn!(target: "lumen::transport", "读取失败，关闭流: {err}");
                stream.close();
                return;
            }
            Step::Idle => break,
        }
    }
    stream.update_interest();
}

fn deliver_read(stream: &SocketStream, data: &[u8]) {
    let callback = stream.inner.borrow_mut().read_callback.take();
    let Some(mut callback) = callback else { return };
    callback(stream, data);
    let mut inner = stream.inner.borrow_mut();
    if inner.read_callback.is_none() && inner.state != SocketState::Closed {
        inner.read_callback = Some(callback);
    }
}

/// 可写处理：完成出站连接、冲刷传输缓冲、自队首排水写队列。
fn writable_ready(stream: &SocketStream) {
    let pending = stream.inner.borrow().connect_pending;
    if pending {
        finish_connect(stream);
        if stream.state() != SocketState::Open {
            return;
        }
    }

    {
        let mut inner = stream.inner.borrow_mut();
        if let Err(code) = inner.transport.flush() {
            drop(inner);
            let err = TransportError::TransportWriteError(code);
            tracing::warn!(target: "lumen::transport", "冲刷传输缓冲失败，关闭流: {err}");
            stream.close();
            return;
        }
    }

    loop {
        enum Step {
            Fire(Option<WriteCallback>),
            Blocked,
            Drained,
            Fatal(i32),
        }
        let step = {
            let mut inner = stream.inner.borrow_mut();
            if inner.state != SocketState::Open {
                return;
            }
            let inner_mut = &mut *inner;
            match inner_mut.write_queue.front_mut() {
                None => Step::Drained,
                Some(op) => match op.advance(inner_mut.transport.as_mut()) {
                    Advance::Complete => {
                        let mut op = inner_mut
                            .write_queue
                            .pop_front()
                            .unwrap_or_else(|| WriteOperation::noop(None));
                        Step::Fire(op.take_callback())
                    }
                    Advance::Blocked => Step::Blocked,
                    Advance::Failed(code) => Step::Fatal(code),
                },
            }
        };
        match step {
            Step::Fire(callback) => {
                if let Some(callback) = callback {
                    callback();
                }
            }
            Step::Blocked => return,
            Step::Drained => break,
            Step::Fatal(code) => {
                let err = TransportError::TransportWriteError(code);
                tracing::warn!(target: "lumen::transport", "写入失败，关闭流: {err}");
                stream.close();
                return;
            }
        }
    }
    stream.update_interest();
}

/// 出站连接就绪：核对 SO_ERROR，成功进入打开态并触发完成回调。
fn finish_connect(stream: &SocketStream) {
    let result = {
        let mut inner = stream.inner.borrow_mut();
        inner.transport.finish_connect()
    };
    match result {
        Ok(Some(peer)) => {
            let callback = {
                let mut inner = stream.inner.borrow_mut();
                inner.connect_pending = false;
                inner.state = SocketState::Open;
                inner.peer = Some(peer);
                inner.connected_callback.take()
            };
            if let Some(callback) = callback {
                callback(stream);
            }
            stream.update_interest();
        }
        Ok(None) => {}
        Err(code) => {
            let err = TransportError::ConnectFailed(code);
            tracing::warn!(target: "lumen::transport", "出站连接失败，关闭流: {err}");
            stream.close();
        }
    }
}
