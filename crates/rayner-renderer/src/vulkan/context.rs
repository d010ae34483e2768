//! Instance, ray tracing capable device and queues, with or without a surface.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;
use std::time::Duration;

use ash::{vk, Entry, Instance, Device};
use ash::khr::{surface, swapchain};
use ash::khr::{acceleration_structure, ray_tracing_pipeline, deferred_host_operations};
use raw_window_handle::RawDisplayHandle;

use super::debug::{DebugMessenger, DebugSink, TracingSink};
use super::{or_cleanup, APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::error::{RenderError, RenderResult};

/// Ray tracing properties of the selected physical device.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub min_scratch_offset_alignment: u32,
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Options for [`VulkanContext::new`].
#[derive(Clone)]
pub struct ContextOptions {
    pub enable_validation: bool,
    pub fence_timeout: Duration,
    pub sink: Arc<dyn DebugSink>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            enable_validation: false,
            fence_timeout: Duration::from_secs(10),
            sink: Arc::new(TracingSink),
        }
    }
}

/// Device-level state shared by every other Vulkan object.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_families: QueueFamilyIndices,

    // Queues
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub transfer_queue: Option<vk::Queue>,

    // Extension loaders
    pub surface_loader: surface::Instance,
    pub swapchain_loader: Option<swapchain::Device>,
    pub accel_struct_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,

    // Capabilities
    pub rt_properties: RtProperties,
    pub device_properties: vk::PhysicalDeviceProperties,
    pub device_features: vk::PhysicalDeviceFeatures,

    /// Upper bound for every fence wait.
    pub fence_timeout: Duration,

    debug_messenger: Option<DebugMessenger>,
}

impl VulkanContext {
    /// Create the instance and device.
    ///
    /// `display_handle` is `None` for headless use: no surface or swapchain
    /// extensions are enabled and presentation is unavailable.
    pub unsafe fn new(
        display_handle: Option<RawDisplayHandle>,
        options: ContextOptions,
    ) -> RenderResult<Self> {
        let entry = Entry::linked();

        // Check Vulkan version
        let api_version = match entry.try_enumerate_instance_version()
            .map_err(RenderError::construction("enumerate instance version"))?
        {
            Some(version) => version,
            None => vk::API_VERSION_1_0,
        };

        if api_version < REQUIRED_VK_VERSION {
            return Err(RenderError::Construction(format!(
                "Vulkan 1.3 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, display_handle, options.enable_validation)?;

        let debug_messenger = if options.enable_validation {
            Some(or_cleanup(
                DebugMessenger::new(&entry, &instance, options.sink.clone()),
                || instance.destroy_instance(None),
            )?)
        } else {
            None
        };
        let destroy_instance = || {
            if let Some(messenger) = &debug_messenger {
                messenger.destroy();
            }
            instance.destroy_instance(None);
        };

        let surface_loader = surface::Instance::new(&entry, &instance);

        let (physical_device, queue_families, rt_properties) =
            or_cleanup(Self::pick_physical_device(&instance), destroy_instance)?;

        let device_properties = instance.get_physical_device_properties(physical_device);
        let device_features = instance.get_physical_device_features(physical_device);

        let presentable = display_handle.is_some();
        let (device, graphics_queue, present_queue, transfer_queue) = or_cleanup(
            Self::create_logical_device(
                &instance,
                physical_device,
                &queue_families,
                &device_features,
                presentable,
            ),
            destroy_instance,
        )?;

        let swapchain_loader = presentable.then(|| swapchain::Device::new(&instance, &device));
        let accel_struct_loader = acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_families,
            graphics_queue,
            present_queue,
            transfer_queue,
            surface_loader,
            swapchain_loader,
            accel_struct_loader,
            rt_pipeline_loader,
            rt_properties,
            device_properties,
            device_features,
            fence_timeout: options.fence_timeout,
            debug_messenger,
        })
    }

    /// Instance with the surface extensions `display_handle` needs, plus
    /// debug utils when validating.
    unsafe fn create_instance(
        entry: &Entry,
        display_handle: Option<RawDisplayHandle>,
        enable_validation: bool,
    ) -> RenderResult<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        // Surface extensions for the windowing system, if any
        let mut extensions = match display_handle {
            Some(handle) => ash_window::enumerate_required_extensions(handle)
                .map_err(RenderError::construction("query required surface extensions"))?
                .to_vec(),
            None => Vec::new(),
        };

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter()
            .map(|n| n.as_ptr())
            .collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry.create_instance(&create_info, None)
            .map_err(RenderError::construction("create Vulkan instance"))
    }

    /// Select the best physical device with ray tracing support.
    unsafe fn pick_physical_device(
        instance: &Instance,
    ) -> RenderResult<(vk::PhysicalDevice, QueueFamilyIndices, RtProperties)> {
        let devices = instance.enumerate_physical_devices()
            .map_err(RenderError::construction("enumerate physical devices"))?;

        if devices.is_empty() {
            return Err(RenderError::Construction("No Vulkan-capable GPU found".to_string()));
        }

        let best = devices.iter()
            .filter_map(|&device| {
                let score = Self::rate_device(instance, device);
                (score > 0).then_some((device, score))
            })
            .max_by_key(|&(_, score)| score);

        let Some((physical_device, _)) = best else {
            return Err(RenderError::Construction(
                "No GPU with acceleration structure and ray tracing pipeline support found".to_string(),
            ));
        };

        let queue_families = Self::find_queue_families(instance, physical_device);
        let rt_properties = Self::query_rt_properties(instance, physical_device);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        tracing::info!(
            gpu = %name,
            handle_size = rt_properties.shader_group_handle_size,
            dedicated_transfer = queue_families.transfer.is_some(),
            "Selected GPU"
        );

        Ok((physical_device, queue_families, rt_properties))
    }

    /// Rate a physical device (higher is better, zero is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u32 {
        let props = instance.get_physical_device_properties(device);

        if props.api_version < REQUIRED_VK_VERSION {
            return 0;
        }

        if Self::find_queue_families(instance, device).graphics.is_none() {
            return 0;
        }

        if !Self::supports_ray_tracing(instance, device) {
            return 0;
        }

        // Push constants carry 64-bit device addresses
        if instance.get_physical_device_features(device).shader_int64 != vk::TRUE {
            return 0;
        }

        let mut score = 1u32;

        // Prefer discrete GPU
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        // Add VRAM size to score
        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score = score.saturating_add((heap.size / (1024 * 1024)) as u32);
            }
        }

        score
    }

    /// Graphics, present and a transfer-only family when there is one.
    ///
    /// Presentation support is checked against the surface once it exists;
    /// until then the graphics family doubles as the present family.
    unsafe fn find_queue_families(instance: &Instance, device: vk::PhysicalDevice) -> QueueFamilyIndices {
        let families = instance.get_physical_device_queue_family_properties(device);
        pick_queue_families(&families)
    }

    /// Check for the extensions and features the ray tracer needs.
    unsafe fn supports_ray_tracing(instance: &Instance, device: vk::PhysicalDevice) -> bool {
        let extensions = match instance.enumerate_device_extension_properties(device) {
            Ok(ext) => ext,
            Err(_) => return false,
        };

        let has = |wanted: &CStr| {
            extensions.iter().any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };

        if !has(acceleration_structure::NAME)
            || !has(ray_tracing_pipeline::NAME)
            || !has(deferred_host_operations::NAME)
        {
            return false;
        }

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut rt_features)
            .push_next(&mut vulkan_12_features);

        instance.get_physical_device_features2(device, &mut features2);

        accel_features.acceleration_structure == vk::TRUE
            && rt_features.ray_tracing_pipeline == vk::TRUE
            && vulkan_12_features.buffer_device_address == vk::TRUE
    }

    unsafe fn query_rt_properties(instance: &Instance, device: vk::PhysicalDevice) -> RtProperties {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut accel_props);

        instance.get_physical_device_properties2(device, &mut props2);

        RtProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            min_scratch_offset_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
        }
    }

    /// Device with ray tracing, buffer device address and int64 enabled.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        supported: &vk::PhysicalDeviceFeatures,
        presentable: bool,
    ) -> RenderResult<(Device, vk::Queue, vk::Queue, Option<vk::Queue>)> {
        let graphics_family = queue_families.graphics
            .ok_or_else(|| RenderError::Construction("No graphics queue family".to_string()))?;

        let mut unique_families = vec![graphics_family];
        for family in [queue_families.present, queue_families.transfer].into_iter().flatten() {
            if !unique_families.contains(&family) {
                unique_families.push(family);
            }
        }

        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<_> = unique_families.iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let mut extensions: Vec<*const c_char> = vec![
            acceleration_structure::NAME.as_ptr(),
            ray_tracing_pipeline::NAME.as_ptr(),
            deferred_host_operations::NAME.as_ptr(),
        ];
        if presentable {
            extensions.push(swapchain::NAME.as_ptr());
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

        // Ray and hit overlays use thick lines and large points when available
        let device_features = vk::PhysicalDeviceFeatures::default()
            .wide_lines(supported.wide_lines == vk::TRUE)
            .large_points(supported.large_points == vk::TRUE)
            .shader_int64(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(device_features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = instance.create_device(physical_device, &create_info, None)
            .map_err(RenderError::construction("create logical device"))?;

        let graphics_queue = device.get_device_queue(graphics_family, 0);
        let present_queue = device.get_device_queue(queue_families.present.unwrap_or(graphics_family), 0);
        let transfer_queue = queue_families.transfer.map(|f| device.get_device_queue(f, 0));

        Ok((device, graphics_queue, present_queue, transfer_queue))
    }

    /// Swapchain loader; errors for headless contexts.
    pub fn swapchain_loader(&self) -> RenderResult<&swapchain::Device> {
        self.swapchain_loader.as_ref().ok_or_else(|| {
            RenderError::InvalidState("context was created without presentation support".to_string())
        })
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout.as_nanos().min(u128::from(u64::MAX)) as u64
    }

    /// Wait for a fence, bounded by the context's fence timeout.
    pub unsafe fn wait_for_fence(&self, fence: vk::Fence, what: &'static str) -> RenderResult<()> {
        match self.device.wait_for_fences(&[fence], true, self.fence_timeout_ns()) {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::Timeout {
                what,
                timeout_ms: self.fence_timeout.as_millis() as u64,
            }),
            Err(e) => Err(RenderError::vk("vkWaitForFences")(e)),
        }
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe {
            self.device.device_wait_idle().map_err(RenderError::vk("vkDeviceWaitIdle"))
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.device.destroy_device(None);

            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy();
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Pick graphics and dedicated transfer families from the family list.
fn pick_queue_families(families: &[vk::QueueFamilyProperties]) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        let flags = family.queue_flags;

        if flags.contains(vk::QueueFlags::GRAPHICS) && indices.graphics.is_none() {
            indices.graphics = Some(i);
            indices.present = Some(i);
        }

        // Dedicated transfer queue: transfer without graphics, prefer no compute
        if flags.contains(vk::QueueFlags::TRANSFER) && !flags.contains(vk::QueueFlags::GRAPHICS) {
            let better = match indices.transfer {
                None => true,
                Some(current) => {
                    families[current as usize].queue_flags.contains(vk::QueueFlags::COMPUTE)
                        && !flags.contains(vk::QueueFlags::COMPUTE)
                }
            };
            if better {
                indices.transfer = Some(i);
            }
        }
    }

    indices
}
