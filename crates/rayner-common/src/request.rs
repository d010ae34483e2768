//! Render commands and the immutable per-frame request built from them.
//!
//! Input handlers push [`RenderCommand`]s into a [`CommandQueue`]; once per
//! frame the [`RequestBuilder`] drains the queue and hands the renderer a
//! [`FrameRequest`] snapshot.

use std::collections::VecDeque;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

/// Which ray tracing pipeline a launch uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    /// Sample points on the selected subset into the output buffer.
    Points,
    /// Trace rays from the selected subset and record hits.
    Rays,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderCommand {
    ToggleTriangles,
    ToggleRays,
    TogglePoints,
    ToggleHits,
    LaunchPoints,
    LaunchRays,
    NextSubset,
    PreviousSubset,
    SetRayCount(u32),
    SetPointCount(u32),
}

/// One ray tracing dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRequest {
    pub kind: TraceKind,
    pub count: u32,
    pub mesh_selector: u64,
}

/// Everything the renderer needs to know about one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequest {
    pub show_triangles: bool,
    pub show_rays: bool,
    pub show_points: bool,
    pub show_hits: bool,
    pub trace: Option<TraceRequest>,
    /// Points currently held in the output buffer.
    pub point_count: u32,
    /// Rays currently held in the origin/direction/hit buffers.
    pub ray_count: u32,
}

/// Producer side of the command queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    sender: Sender<RenderCommand>,
}

impl CommandQueue {
    /// Queue a command. Returns false when the queue is full or closed.
    pub fn send(&self, command: RenderCommand) -> bool {
        match self.sender.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Queue capacity. Commands come from key presses, so this is never reached
/// in practice.
const QUEUE_CAPACITY: usize = 256;

/// Consumer side: folds queued commands into persistent state.
#[derive(Debug)]
pub struct RequestBuilder {
    receiver: Receiver<RenderCommand>,
    selectors: Vec<u64>,
    subset: usize,
    max_count: u32,
    ray_count: u32,
    point_count: u32,
    rays_in_buffer: u32,
    points_in_buffer: u32,
    show_triangles: bool,
    show_rays: bool,
    show_points: bool,
    show_hits: bool,
    pending: VecDeque<TraceKind>,
}

impl RequestBuilder {
    /// Create a builder and its queue.
    ///
    /// `selectors` holds the encoded mesh subsets (see
    /// [`MeshSubset::selector`](crate::mesh::MeshSubset::selector)); counts
    /// are clamped to `max_count`.
    pub fn new(selectors: Vec<u64>, max_count: u32, rays: u32, points: u32) -> (Self, CommandQueue) {
        let (sender, receiver) = channel::bounded(QUEUE_CAPACITY);
        let builder = Self {
            receiver,
            selectors,
            subset: 0,
            max_count,
            ray_count: rays.min(max_count),
            point_count: points.min(max_count),
            rays_in_buffer: 0,
            points_in_buffer: 0,
            show_triangles: true,
            show_rays: true,
            show_points: true,
            show_hits: true,
            pending: VecDeque::new(),
        };
        (builder, CommandQueue { sender })
    }

    /// Currently selected subset index.
    pub fn subset(&self) -> usize {
        self.subset
    }

    fn apply(&mut self, command: RenderCommand) {
        match command {
            RenderCommand::ToggleTriangles => self.show_triangles = !self.show_triangles,
            RenderCommand::ToggleRays => self.show_rays = !self.show_rays,
            RenderCommand::TogglePoints => self.show_points = !self.show_points,
            RenderCommand::ToggleHits => self.show_hits = !self.show_hits,
            RenderCommand::LaunchPoints => self.pending.push_back(TraceKind::Points),
            RenderCommand::LaunchRays => self.pending.push_back(TraceKind::Rays),
            RenderCommand::NextSubset => {
                if !self.selectors.is_empty() {
                    self.subset = (self.subset + 1) % self.selectors.len();
                }
            }
            RenderCommand::PreviousSubset => {
                if !self.selectors.is_empty() {
                    self.subset = (self.subset + self.selectors.len() - 1) % self.selectors.len();
                }
            }
            RenderCommand::SetRayCount(n) => self.ray_count = n.min(self.max_count),
            RenderCommand::SetPointCount(n) => self.point_count = n.min(self.max_count),
        }
    }

    /// Drain queued commands and snapshot the frame. At most one trace is
    /// issued per frame; further launches wait for later frames.
    pub fn next_frame(&mut self) -> FrameRequest {
        while let Ok(command) = self.receiver.try_recv() {
            self.apply(command);
        }

        let selector = self.selectors.get(self.subset).copied().unwrap_or(0);
        let trace = self.pending.pop_front().and_then(|kind| {
            let count = match kind {
                TraceKind::Points => self.point_count,
                TraceKind::Rays => self.ray_count,
            };
            (count > 0).then_some(TraceRequest { kind, count, mesh_selector: selector })
        });

        match trace {
            Some(TraceRequest { kind: TraceKind::Points, count, .. }) => self.points_in_buffer = count,
            Some(TraceRequest { kind: TraceKind::Rays, count, .. }) => self.rays_in_buffer = count,
            None => {}
        }

        FrameRequest {
            show_triangles: self.show_triangles,
            show_rays: self.show_rays,
            show_points: self.show_points,
            show_hits: self.show_hits,
            trace,
            point_count: self.points_in_buffer,
            ray_count: self.rays_in_buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> (RequestBuilder, CommandQueue) {
        RequestBuilder::new(vec![10, 20, 30], 4096, 1000, 500)
    }

    // ============================================================
    // Toggles
    // ============================================================

    #[test]
    fn test_defaults_show_everything_and_trace_nothing() {
        let (mut builder, _queue) = builder();
        let frame = builder.next_frame();
        assert!(frame.show_triangles && frame.show_rays && frame.show_points && frame.show_hits);
        assert_eq!(frame.trace, None);
        assert_eq!(frame.ray_count, 0);
        assert_eq!(frame.point_count, 0);
    }

    #[test]
    fn test_toggle_persists_across_frames() {
        let (mut builder, queue) = builder();
        assert!(queue.send(RenderCommand::ToggleRays));
        assert!(!builder.next_frame().show_rays);
        assert!(!builder.next_frame().show_rays);
        queue.send(RenderCommand::ToggleRays);
        assert!(builder.next_frame().show_rays);
    }

    // ============================================================
    // Launches
    // ============================================================

    #[test]
    fn test_launch_rays_is_one_shot() {
        let (mut builder, queue) = builder();
        queue.send(RenderCommand::LaunchRays);
        let frame = builder.next_frame();
        assert_eq!(
            frame.trace,
            Some(TraceRequest { kind: TraceKind::Rays, count: 1000, mesh_selector: 10 })
        );
        assert_eq!(frame.ray_count, 1000);

        let next = builder.next_frame();
        assert_eq!(next.trace, None);
        assert_eq!(next.ray_count, 1000);
    }

    #[test]
    fn test_rays_before_any_points_stand_alone() {
        let (mut builder, queue) = builder();
        queue.send(RenderCommand::NextSubset);
        queue.send(RenderCommand::LaunchRays);
        let frame = builder.next_frame();
        assert_eq!(
            frame.trace,
            Some(TraceRequest { kind: TraceKind::Rays, count: 1000, mesh_selector: 20 })
        );
        assert_eq!(frame.ray_count, 1000);
        assert_eq!(frame.point_count, 0);

        // Sampling points afterwards leaves the traced rays drawable.
        queue.send(RenderCommand::LaunchPoints);
        let frame = builder.next_frame();
        assert_eq!(frame.trace.map(|t| t.count), Some(500));
        assert_eq!(frame.ray_count, 1000);
        assert_eq!(frame.point_count, 500);
    }

    #[test]
    fn test_two_launches_spread_over_two_frames() {
        let (mut builder, queue) = builder();
        queue.send(RenderCommand::LaunchPoints);
        queue.send(RenderCommand::LaunchRays);
        assert_eq!(builder.next_frame().trace.map(|t| t.kind), Some(TraceKind::Points));
        assert_eq!(builder.next_frame().trace.map(|t| t.kind), Some(TraceKind::Rays));
        assert_eq!(builder.next_frame().trace, None);
    }

    #[test]
    fn test_zero_count_launch_is_dropped() {
        let (mut builder, queue) = builder();
        queue.send(RenderCommand::SetRayCount(0));
        queue.send(RenderCommand::LaunchRays);
        assert_eq!(builder.next_frame().trace, None);
    }

    #[test]
    fn test_counts_clamp_to_capacity() {
        let (mut builder, queue) = RequestBuilder::new(vec![0], 64, 1000, 1000);
        queue.send(RenderCommand::LaunchPoints);
        assert_eq!(builder.next_frame().trace.map(|t| t.count), Some(64));
        queue.send(RenderCommand::SetRayCount(9000));
        queue.send(RenderCommand::LaunchRays);
        assert_eq!(builder.next_frame().trace.map(|t| t.count), Some(64));
    }

    // ============================================================
    // Subset selection
    // ============================================================

    #[test]
    fn test_subset_selection_wraps() {
        let (mut builder, queue) = builder();
        queue.send(RenderCommand::PreviousSubset);
        queue.send(RenderCommand::LaunchPoints);
        let frame = builder.next_frame();
        assert_eq!(builder.subset(), 2);
        assert_eq!(frame.trace.map(|t| t.mesh_selector), Some(30));

        queue.send(RenderCommand::NextSubset);
        builder.next_frame();
        assert_eq!(builder.subset(), 0);
    }

    #[test]
    fn test_subset_commands_without_subsets() {
        let (mut builder, queue) = RequestBuilder::new(vec![], 16, 4, 4);
        queue.send(RenderCommand::NextSubset);
        queue.send(RenderCommand::LaunchRays);
        let frame = builder.next_frame();
        assert_eq!(frame.trace.map(|t| t.mesh_selector), Some(0));
    }
}
