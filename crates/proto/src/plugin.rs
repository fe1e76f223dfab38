use crate::{proto, IdentityService, VolumeExpansionSupport};
use proto::plugin_capability::{service, volume_expansion, Service, Type, VolumeExpansion};
use tracing::debug;

#[inline]
fn service_capability(r#type: service::Type) -> proto::PluginCapability {
  proto::PluginCapability {
    r#type: Some(Type::Service(Service {
      r#type: r#type.into(),
    })),
  }
}

#[inline]
fn expansion_capability(r#type: volume_expansion::Type) -> proto::PluginCapability {
  proto::PluginCapability {
    r#type: Some(Type::VolumeExpansion(VolumeExpansion {
      r#type: r#type.into(),
    })),
  }
}

/// Plugin capabilities of a plugin that serves the controller service.
pub(crate) fn get_capabilities(s: &impl IdentityService) -> proto::GetPluginCapabilitiesResponse {
  let mut response = proto::GetPluginCapabilitiesResponse::default();
  response
    .capabilities
    .push(service_capability(service::Type::ControllerService));

  let volume_accessibility_constraints_support = s.volume_accessibility_constraints_support();
  if volume_accessibility_constraints_support {
    response
      .capabilities
      .push(service_capability(service::Type::VolumeAccessibilityConstraints));
  }

  let volume_expansion_support = s.volume_expansion_support();
  match volume_expansion_support {
    VolumeExpansionSupport::None => (),
    VolumeExpansionSupport::Offline => response
      .capabilities
      .push(expansion_capability(volume_expansion::Type::Offline)),
    VolumeExpansionSupport::Online => response
      .capabilities
      .push(expansion_capability(volume_expansion::Type::Online)),
  }

  debug!(
    ?volume_accessibility_constraints_support,
    ?volume_expansion_support
  );
  response
}
